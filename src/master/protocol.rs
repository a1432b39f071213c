//! Text formats exchanged over duplex channels
//!
//! ```text
//! client  -> master   Q:<command>:<arguments>
//! master  -> slave    C:<command>:
//! slave   -> master   P:<pid>:<identifier>     (also sent by command processes)
//! slave   -> master   R:                       boot finished
//! slave   -> master   E:<error text>           boot failed
//! ```
//!
//! Fields are separated by `:`; the last field may itself contain `:`.

use crate::error::ProtocolError;

/// A client asking to run `command` with an opaque `arguments` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub arguments: String,
}

/// Pid report from a slave or a command process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidReport {
    pub pid: i32,
    pub identifier: String,
}

/// Outcome of a slave's boot sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootReport {
    Ready,
    Failed(String),
}

/// Parse `Q:<command>:<arguments>`
pub fn parse_command_request(msg: &str) -> Result<CommandRequest, ProtocolError> {
    let mut parts = msg.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Q"), Some(command), Some(arguments)) if !command.is_empty() => Ok(CommandRequest {
            command: command.to_string(),
            arguments: arguments.to_string(),
        }),
        _ => Err(unexpected("command request", msg)),
    }
}

pub fn create_command_request(command: &str, arguments: &str) -> String {
    format!("Q:{}:{}", command, arguments)
}

pub fn create_spawn_command(command: &str) -> String {
    format!("C:{}:", command)
}

/// Parse `C:<command>:`, returning the command name
pub fn parse_spawn_command(msg: &str) -> Result<&str, ProtocolError> {
    let mut parts = msg.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("C"), Some(command), Some(_)) if !command.is_empty() => Ok(command),
        _ => Err(unexpected("spawn command", msg)),
    }
}

/// Parse `P:<pid>:<identifier>`
pub fn parse_pid(msg: &str) -> Result<PidReport, ProtocolError> {
    let mut parts = msg.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("P"), Some(pid), Some(identifier)) => {
            let pid = pid
                .parse::<i32>()
                .ok()
                .filter(|pid| *pid > 0)
                .ok_or_else(|| ProtocolError::InvalidPid(pid.to_string()))?;
            Ok(PidReport {
                pid,
                identifier: identifier.to_string(),
            })
        }
        _ => Err(unexpected("pid", msg)),
    }
}

pub fn create_pid(pid: i32, identifier: &str) -> String {
    format!("P:{}:{}", pid, identifier)
}

/// Parse `R:` or `E:<error text>`
pub fn parse_boot_report(msg: &str) -> Result<BootReport, ProtocolError> {
    match msg.split_once(':') {
        Some(("R", _)) => Ok(BootReport::Ready),
        Some(("E", error)) => Ok(BootReport::Failed(error.to_string())),
        _ => Err(unexpected("boot report", msg)),
    }
}

fn unexpected(expected: &'static str, got: &str) -> ProtocolError {
    ProtocolError::UnexpectedMessage {
        expected,
        got: got.to_string(),
    }
}
