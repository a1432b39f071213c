//! Client listener: accepts connections on `.zeus.sock`
//!
//! Binding happens up front so a missing listener stops startup. The accept
//! loop then runs as a supervised subsystem and starts a handler thread for
//! every connection itself; there is no separate dispatch queue.
//!
//! On stop the listener closes the socket, removes the socket file, and then
//! waits for every handler it started. Handlers are never cancelled, so the
//! stop is acknowledged only once in-flight handshakes have finished.

use crate::error::ListenerError;
use crate::master::channel::DuplexChannel;
use crate::master::handler::handle_client_connection;
use crate::master::supervisor::{Subsystem, SubsystemContext};
use crate::master::tree::ProcessTree;
use anyhow::Result;
use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Socket file name, relative to the project directory
pub const SOCKET_NAME: &str = ".zeus.sock";

/// Delay after a failed accept before trying again
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// How often an idle accept loop checks for a stop request
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A bound listener plus the tree that connections are routed through
pub struct ClientListener {
    socket_path: PathBuf,
    listener: UnixListener,
    tree: Arc<ProcessTree>,
    handlers: Vec<JoinHandle<()>>,
}

impl ClientListener {
    /// Bind `socket_path`, replacing a stale socket file left by a dead master
    pub fn bind(socket_path: impl AsRef<Path>, tree: Arc<ProcessTree>) -> Result<Self, ListenerError> {
        let socket_path = absolute(socket_path.as_ref());
        let bind_error = |source: io::Error| ListenerError::Bind {
            path: socket_path.clone(),
            source,
        };

        if socket_path.exists() {
            if UnixStream::connect(&socket_path).is_ok() {
                return Err(ListenerError::AlreadyRunning(socket_path.clone()));
            }
            debug!(path = %socket_path.display(), "removing stale socket");
            fs::remove_file(&socket_path).map_err(bind_error)?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(bind_error)?;

        // Set socket permissions to 0600 (owner read/write only)
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))
                .map_err(bind_error)?;
        }

        // Non-blocking accept so the loop can notice stop requests
        listener.set_nonblocking(true).map_err(bind_error)?;

        Ok(Self {
            socket_path,
            listener,
            tree,
            handlers: Vec::new(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of handlers started and not yet reaped
    pub fn active_handlers(&self) -> usize {
        self.handlers.len()
    }

    fn dispatch(&mut self, stream: UnixStream) {
        self.handlers.retain(|handler| !handler.is_finished());

        let tree = Arc::clone(&self.tree);
        let spawned = thread::Builder::new()
            .name("zeus-client".to_string())
            .spawn(move || handle_client_connection(&tree, DuplexChannel::new(stream)));
        match spawned {
            Ok(handler) => self.handlers.push(handler),
            Err(e) => error!("unable to start client handler: {}", e),
        }
    }
}

impl Subsystem for ClientListener {
    fn name(&self) -> &'static str {
        "client-listener"
    }

    fn run(mut self: Box<Self>, ctx: SubsystemContext) -> Result<()> {
        info!(path = %self.socket_path.display(), "listening for clients");

        while !ctx.stop.is_stopped() {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    // Handlers block on their peers; only the listener polls
                    if let Err(e) = stream.set_nonblocking(false) {
                        error!("unable to configure client connection: {}", e);
                        continue;
                    }
                    self.dispatch(stream);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ctx.stop.wait_timeout(POLL_INTERVAL);
                }
                Err(e) => {
                    error!("unable to accept socket connection: {}", e);
                    ctx.stop.wait_timeout(ACCEPT_RETRY_DELAY);
                }
            }
        }

        let ClientListener {
            socket_path,
            listener,
            handlers,
            ..
        } = *self;
        drop(listener);
        if let Err(e) = fs::remove_file(&socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!(path = %socket_path.display(), "failed to remove socket: {}", e);
            }
        }

        if !handlers.is_empty() {
            debug!(count = handlers.len(), "waiting for in-flight handlers");
        }
        for handler in handlers {
            if handler.join().is_err() {
                error!("client handler panicked");
            }
        }
        debug!("client listener stopped");

        Ok(())
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
