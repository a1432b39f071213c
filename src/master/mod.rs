/// Zeus master process
///
/// - `channel`: length-prefixed messages and descriptor passing over unix sockets
/// - `protocol`: the `Q:`, `C:`, `P:`, `R:` and `E:` message formats
/// - `tree`: slave and command nodes loaded from `zeus.json`
/// - `handler`: the per-client handshake that hands a terminal to a command
/// - `listener`: accept loop on `.zeus.sock`
/// - `supervisor`: subsystem threads, exit requests and coordinated shutdown
/// - `config`, `slave_monitor`, `file_monitor`: the subsystems' collaborators

pub mod channel;
pub mod config;
pub mod file_monitor;
pub mod handler;
pub mod listener;
pub mod protocol;
pub mod slave_monitor;
pub mod supervisor;
pub mod tree;

pub use channel::DuplexChannel;
pub use config::{MasterConfig, CONFIG_FILE};
pub use file_monitor::FileMonitor;
pub use handler::{handle_client_connection, run_handshake, HandshakeOutcome};
pub use listener::{ClientListener, SOCKET_NAME};
pub use slave_monitor::SlaveMonitor;
pub use supervisor::{
    ExitHandle, ShutdownTrigger, StopToken, Subsystem, SubsystemContext, Supervisor,
    SupervisorState,
};
pub use tree::{BootState, CommandNode, ProcessTree, SlaveNode};
