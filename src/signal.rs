use crate::master::supervisor::ExitHandle;
use anyhow::Result;
use signal_hook::consts::SIGINT;
use signal_hook::iterator::{Handle, Signals};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Forwards SIGINT to the supervisor as an interrupt trigger
///
/// Only SIGINT is handled; every other signal keeps its default disposition.
pub struct InterruptListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl InterruptListener {
    pub fn spawn(exit: ExitHandle) -> Result<Self> {
        let mut signals = Signals::new([SIGINT])?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("zeus-signals".to_string())
            .spawn(move || {
                for sig in signals.forever() {
                    if sig == SIGINT {
                        debug!("received SIGINT");
                        exit.interrupt();
                    }
                }
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Stop listening and join the forwarding thread
    pub fn close(mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
