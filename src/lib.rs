// Library interface for the zeus master
// This allows the binary, benchmarks and tests to access internal modules

pub mod error;
pub mod logging;
pub mod master;
pub mod signal;
