//! Process tree: commands and the slaves that fork them
//!
//! The tree is built once at startup and shared read-only. A `SlaveNode` has
//! interior state that the slave monitor fills in as its process boots:
//! - the persistent channel used to send spawn requests
//! - the boot state (waited on by handlers)
//! - a permanent boot error, if the slave failed
//! - a delivery queue of command-process descriptors, one per spawn request

use crate::error::{ConfigError, HandshakeError};
use crate::master::channel::DuplexChannel;
use crate::master::protocol::create_spawn_command;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, warn};

/// Boot progress of a slave process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Booting,
    Booted,
}

/// One booted (or booting) slave process
#[derive(Debug)]
pub struct SlaveNode {
    identifier: String,
    /// Write side of the persistent channel to the slave
    channel: Mutex<Option<DuplexChannel>>,
    boot: Mutex<BootState>,
    booted: Condvar,
    error: OnceLock<String>,
    deliver_tx: Mutex<Option<Sender<OwnedFd>>>,
    /// Held for a whole spawn round trip so responses can't be crossed
    deliver_rx: Mutex<Receiver<OwnedFd>>,
}

impl SlaveNode {
    pub fn new(identifier: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            identifier: identifier.into(),
            channel: Mutex::new(None),
            boot: Mutex::new(BootState::Booting),
            booted: Condvar::new(),
            error: OnceLock::new(),
            deliver_tx: Mutex::new(Some(tx)),
            deliver_rx: Mutex::new(rx),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Install the channel used for spawn requests
    pub fn attach_channel(&self, channel: DuplexChannel) {
        *lock(&self.channel) = Some(channel);
    }

    pub fn mark_booted(&self) {
        *lock(&self.boot) = BootState::Booted;
        self.booted.notify_all();
    }

    pub fn boot_state(&self) -> BootState {
        *lock(&self.boot)
    }

    /// Block until the slave finished booting (successfully or not)
    pub fn wait_until_booted(&self) {
        let mut state = lock(&self.boot);
        while *state == BootState::Booting {
            state = self
                .booted
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Record a permanent error for this slave
    ///
    /// Only the first error sticks. Recording an error also counts as the end
    /// of booting and closes the delivery queue, so handlers blocked on either
    /// wake up. Returns whether this call set the error.
    pub fn record_error(&self, error: impl Into<String>) -> bool {
        let first = self.error.set(error.into()).is_ok();
        lock(&self.deliver_tx).take();
        lock(&self.channel).take();
        self.mark_booted();
        first
    }

    pub fn error(&self) -> Option<&str> {
        self.error.get().map(String::as_str)
    }

    /// Queue a command-process descriptor sent by the slave
    ///
    /// Hands the descriptor back if the queue was closed.
    pub fn deliver_spawned(&self, fd: OwnedFd) -> Result<(), OwnedFd> {
        match lock(&self.deliver_tx).as_ref() {
            Some(tx) => tx.send(fd).map_err(|e| e.0),
            None => Err(fd),
        }
    }

    /// Ask the slave to fork `command` and wait for its descriptor
    ///
    /// One spawn is in flight per slave at a time: the delivery queue stays
    /// locked from the request write until the descriptor arrives.
    pub fn request_spawn(&self, command: &str) -> Result<OwnedFd, HandshakeError> {
        let deliveries = lock(&self.deliver_rx);

        // Nobody else is waiting, so anything already queued is unclaimed
        while let Ok(stale) = deliveries.try_recv() {
            warn!(slave = %self.identifier, "dropping unclaimed command descriptor");
            drop(stale);
        }

        {
            let mut channel = lock(&self.channel);
            let channel = channel
                .as_mut()
                .ok_or_else(|| HandshakeError::SlaveUnavailable(self.identifier.clone()))?;
            channel
                .send_message(&create_spawn_command(command))
                .map_err(HandshakeError::channel("send spawn request"))?;
        }
        debug!(slave = %self.identifier, command, "spawn requested");

        deliveries
            .recv()
            .map_err(|_| HandshakeError::SlaveUnavailable(self.identifier.clone()))
    }
}

/// A runnable command, owned by exactly one slave
#[derive(Debug)]
pub struct CommandNode {
    pub name: String,
    pub aliases: Vec<String>,
    pub slave: Arc<SlaveNode>,
}

/// All slaves and commands, with alias-aware lookup
#[derive(Debug, Default)]
pub struct ProcessTree {
    slaves: Vec<Arc<SlaveNode>>,
    commands: Vec<Arc<CommandNode>>,
    by_name: HashMap<String, Arc<CommandNode>>,
}

impl ProcessTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_slave(&mut self, identifier: impl Into<String>) -> Arc<SlaveNode> {
        let slave = Arc::new(SlaveNode::new(identifier));
        self.slaves.push(Arc::clone(&slave));
        slave
    }

    /// Register a command under its name and every alias
    pub fn add_command(
        &mut self,
        name: impl Into<String>,
        aliases: Vec<String>,
        slave: &Arc<SlaveNode>,
    ) -> Result<Arc<CommandNode>, ConfigError> {
        let node = Arc::new(CommandNode {
            name: name.into(),
            aliases,
            slave: Arc::clone(slave),
        });

        let keys = std::iter::once(&node.name).chain(node.aliases.iter());
        for key in keys.clone() {
            if self.by_name.contains_key(key) {
                return Err(ConfigError::DuplicateCommand(key.clone()));
            }
        }
        for key in keys {
            self.by_name.insert(key.clone(), Arc::clone(&node));
        }

        self.commands.push(Arc::clone(&node));
        Ok(node)
    }

    /// Look up a command by name or alias
    pub fn find_command(&self, name: &str) -> Option<Arc<CommandNode>> {
        self.by_name.get(name).cloned()
    }

    pub fn slaves(&self) -> &[Arc<SlaveNode>] {
        &self.slaves
    }

    pub fn commands(&self) -> &[Arc<CommandNode>] {
        &self.commands
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
