//! Client handshake: hands a client's terminal to a freshly forked command
//!
//! ```text
//! client                     master                     slave / command
//!   │ Q:<command>:<args>  ──▶  │                            │
//!   │ terminal fd         ──▶  │                            │
//!   │                          │ C:<command>:           ──▶ │ (slave channel)
//!   │                          │ ◀── command socket fd      │ (delivery queue)
//!   │                          │ <args>                 ──▶ │ (command channel)
//!   │                          │ terminal fd            ──▶ │
//!   │                          │ ◀── P:<pid>:<identifier>   │
//!   │ ◀── <pid>                │                            │
//!   │                          │ ◀── <exit status>          │
//!   │ ◀── <exit status>        │                            │
//! ```
//!
//! If the slave recorded a boot error the client gets `0`, the error text on
//! its terminal, then `1`. Any other failure closes the client connection
//! without a response. Every handle is dropped on every path.

use crate::error::HandshakeError;
use crate::master::channel::DuplexChannel;
use crate::master::protocol::{parse_command_request, parse_pid};
use crate::master::tree::ProcessTree;
use std::fs::File;
use std::io::Write;
use std::os::fd::OwnedFd;
use tracing::{debug, info, warn};

/// Pid reported to the client when no command process was spawned
pub const ERROR_PID: &str = "0";

/// Exit status reported to the client when no command process was spawned
pub const ERROR_EXIT_STATUS: &str = "1";

/// How a completed handshake ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// A command process ran and its exit status was relayed
    Spawned { pid: i32, exit_status: String },
    /// The slave had a boot error; the synthetic response was sent
    SlaveError,
}

/// Run one client connection to completion, logging any failure
pub fn handle_client_connection(tree: &ProcessTree, client: DuplexChannel) {
    match run_handshake(tree, client) {
        Ok(HandshakeOutcome::Spawned { pid, exit_status }) => {
            debug!(pid, exit_status = %exit_status, "client handshake complete");
        }
        Ok(HandshakeOutcome::SlaveError) => {
            debug!("reported slave boot error to client");
        }
        Err(HandshakeError::UnknownCommand(command)) => {
            warn!(command = %command, "no such command; closing client connection");
        }
        Err(e) => {
            warn!("client handshake aborted: {}", e);
        }
    }
}

/// Execute the handshake; the client channel is closed when this returns
pub fn run_handshake(
    tree: &ProcessTree,
    mut client: DuplexChannel,
) -> Result<HandshakeOutcome, HandshakeError> {
    let msg = client
        .receive_message()
        .map_err(HandshakeError::channel("read command request"))?;
    let request = parse_command_request(&msg)?;

    let command_node = tree
        .find_command(&request.command)
        .ok_or_else(|| HandshakeError::UnknownCommand(request.command.clone()))?;
    let slave = &command_node.slave;
    info!(command = %command_node.name, slave = %slave.identifier(), "client request");

    let terminal = client
        .receive_descriptor()
        .map_err(HandshakeError::channel("read client terminal"))?;

    if slave.error().is_none() {
        slave.wait_until_booted();
    }
    if let Some(error) = slave.error() {
        return report_slave_error(&mut client, terminal, error);
    }

    let command_fd = slave.request_spawn(&command_node.name)?;
    let mut command = DuplexChannel::from_fd(command_fd);

    command
        .send_message(&request.arguments)
        .map_err(HandshakeError::channel("send arguments to command"))?;
    command
        .send_descriptor(&terminal)
        .map_err(HandshakeError::channel("send terminal to command"))?;
    // The command process owns the terminal now
    drop(terminal);

    let msg = command
        .receive_message()
        .map_err(HandshakeError::channel("read command pid"))?;
    let pid = parse_pid(&msg)?.pid;
    client
        .send_message(&pid.to_string())
        .map_err(HandshakeError::channel("send pid to client"))?;

    let exit_status = command
        .receive_message()
        .map_err(HandshakeError::channel("read command exit status"))?;
    client
        .send_message(&exit_status)
        .map_err(HandshakeError::channel("send exit status to client"))?;

    Ok(HandshakeOutcome::Spawned { pid, exit_status })
}

fn report_slave_error(
    client: &mut DuplexChannel,
    terminal: OwnedFd,
    error: &str,
) -> Result<HandshakeOutcome, HandshakeError> {
    client
        .send_message(ERROR_PID)
        .map_err(HandshakeError::channel("send error pid to client"))?;

    let mut terminal = File::from(terminal);
    terminal
        .write_all(error.as_bytes())
        .map_err(HandshakeError::Terminal)?;
    drop(terminal);

    client
        .send_message(ERROR_EXIT_STATUS)
        .map_err(HandshakeError::channel("send error exit status to client"))?;

    Ok(HandshakeOutcome::SlaveError)
}
