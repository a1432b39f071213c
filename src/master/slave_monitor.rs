//! Slave monitor: boots slave processes and pumps their descriptors
//!
//! Every slave node gets its own process, started from the configured boot
//! command with a unix socket inherited as `$ZEUS_MASTER_FD`. The slave then
//! speaks over that socket:
//!
//! ```text
//! slave -> master   P:<pid>:<identifier>
//! slave -> master   R:  |  E:<error text>
//! master -> slave   C:<command>:            (one per spawn request)
//! slave -> master   <descriptor>            (one per spawn request)
//! ```
//!
//! A reader thread per slave marks the node booted, records boot errors, and
//! moves every descriptor the slave sends into the node's delivery queue.

use crate::error::ChannelError;
use crate::master::channel::DuplexChannel;
use crate::master::protocol::{parse_boot_report, parse_pid, BootReport};
use crate::master::supervisor::{Subsystem, SubsystemContext};
use crate::master::tree::{ProcessTree, SlaveNode};
use anyhow::{anyhow, Context, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Environment variable holding the slave's end of the master socket
pub const MASTER_FD_ENV: &str = "ZEUS_MASTER_FD";

/// Environment variable naming the slave node to boot
pub const SLAVE_ENV: &str = "ZEUS_SLAVE";

/// How often exited slaves are reaped
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// How long slaves get to exit after SIGTERM before SIGKILL
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct SlaveProcess {
    identifier: String,
    child: Child,
    exited: Option<ExitStatus>,
    /// Extra handle on the master end, used to wake the reader at shutdown
    control: DuplexChannel,
    reader: Option<JoinHandle<()>>,
}

/// Boots every slave in the tree and keeps them fed with spawn traffic
pub struct SlaveMonitor {
    tree: Arc<ProcessTree>,
    command: String,
    processes: Vec<SlaveProcess>,
}

impl SlaveMonitor {
    pub fn new(tree: Arc<ProcessTree>, command: impl Into<String>) -> Self {
        Self {
            tree,
            command: command.into(),
            processes: Vec::new(),
        }
    }

    fn boot(&self, slave: &Arc<SlaveNode>) -> Result<SlaveProcess> {
        let (master_end, slave_end) = UnixStream::pair()?;
        let inherited = slave_end.as_raw_fd();

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .env(MASTER_FD_ENV, inherited.to_string())
            .env(SLAVE_ENV, slave.identifier())
            .stdin(Stdio::null());

        // Only the slave's end survives exec, and only in this child
        // SAFETY: fcntl is async-signal-safe and touches no shared state
        unsafe {
            command.pre_exec(move || {
                fcntl(inherited, FcntlArg::F_SETFD(FdFlag::empty()))
                    .map(drop)
                    .map_err(std::io::Error::from)
            });
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to launch `{}`", self.command))?;
        drop(slave_end);

        let (control, reader) = match start_reader(slave, master_end) {
            Ok(started) => started,
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(e);
            }
        };

        debug!(slave = %slave.identifier(), pid = child.id(), "slave launched");

        Ok(SlaveProcess {
            identifier: slave.identifier().to_string(),
            child,
            exited: None,
            control,
            reader: Some(reader),
        })
    }

    /// Reap slaves that exited on their own
    fn reap_exited(&mut self) {
        for process in self.processes.iter_mut().filter(|p| p.exited.is_none()) {
            match process.child.try_wait() {
                Ok(Some(status)) => {
                    warn!(slave = %process.identifier, %status, "slave exited");
                    process.exited = Some(status);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(slave = %process.identifier, "error waiting for slave: {}", e);
                }
            }
        }
    }

    /// SIGTERM every slave, wait, then SIGKILL whatever is left
    fn shutdown_slaves(&mut self) {
        let mut remaining: Vec<&mut SlaveProcess> = self
            .processes
            .iter_mut()
            .filter(|p| p.exited.is_none())
            .collect();
        for process in &remaining {
            let pid = Pid::from_raw(process.child.id() as i32);
            let _ = signal::kill(pid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while !remaining.is_empty() && start.elapsed() < SHUTDOWN_TIMEOUT {
            remaining.retain_mut(|process| !matches!(process.child.try_wait(), Ok(Some(_)) | Err(_)));
            if !remaining.is_empty() {
                thread::sleep(Duration::from_millis(50));
            }
        }
        for process in remaining {
            warn!(slave = %process.identifier, "slave ignored SIGTERM, killing");
            kill_and_reap(&mut process.child);
        }

        for process in &mut self.processes {
            let _ = process.control.shutdown();
            if let Some(reader) = process.reader.take() {
                let _ = reader.join();
            }
        }
        self.processes.clear();
    }
}

impl Subsystem for SlaveMonitor {
    fn name(&self) -> &'static str {
        "slave-monitor"
    }

    fn run(mut self: Box<Self>, ctx: SubsystemContext) -> Result<()> {
        for slave in self.tree.slaves().to_vec() {
            match self.boot(&slave) {
                Ok(process) => self.processes.push(process),
                Err(e) => {
                    error!(slave = %slave.identifier(), "{:#}", e);
                    slave.record_error(format!("{:#}\n", e));
                }
            }
        }
        info!(slaves = self.processes.len(), "slaves launched");

        while !ctx.stop.wait_timeout(REAP_INTERVAL) {
            self.reap_exited();
        }

        self.shutdown_slaves();
        debug!("slave monitor stopped");
        Ok(())
    }
}

/// Attach the master end to the node and start its reader thread
///
/// Returns the extra control handle and the reader.
fn start_reader(
    slave: &Arc<SlaveNode>,
    master_end: UnixStream,
) -> Result<(DuplexChannel, JoinHandle<()>)> {
    let writer = DuplexChannel::new(master_end);
    let reader = writer.try_clone()?;
    let control = writer.try_clone()?;
    slave.attach_channel(writer);

    let node = Arc::clone(slave);
    let reader = thread::Builder::new()
        .name(format!("zeus-slave-{}", slave.identifier()))
        .spawn(move || monitor_slave_channel(&node, reader))
        .context("failed to start slave reader")?;

    Ok((control, reader))
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Drive one slave's channel: boot handshake, then descriptor delivery
///
/// Returns when the channel closes; the node is left with a permanent error.
pub fn monitor_slave_channel(slave: &SlaveNode, mut channel: DuplexChannel) {
    let identifier = slave.identifier().to_string();

    match read_boot(&mut channel) {
        Ok(BootReport::Ready) => {
            info!(slave = %identifier, "slave booted");
            slave.mark_booted();
        }
        Ok(BootReport::Failed(error)) => {
            warn!(slave = %identifier, "slave failed to boot");
            slave.record_error(error);
            return;
        }
        Err(e) => {
            warn!(slave = %identifier, "slave failed to boot: {:#}", e);
            slave.record_error(format!("slave {} failed to boot: {:#}\n", identifier, e));
            return;
        }
    }

    loop {
        match channel.receive_descriptor() {
            Ok(fd) => {
                if slave.deliver_spawned(fd).is_err() {
                    break;
                }
            }
            Err(ChannelError::Closed) => {
                warn!(slave = %identifier, "slave connection closed");
                slave.record_error(format!("slave {} terminated\n", identifier));
                break;
            }
            Err(e) => {
                warn!(slave = %identifier, "slave connection failed: {}", e);
                slave.record_error(format!("slave {} terminated: {}\n", identifier, e));
                break;
            }
        }
    }
}

fn read_boot(channel: &mut DuplexChannel) -> Result<BootReport> {
    let msg = channel.receive_message().context("waiting for pid")?;
    let report = parse_pid(&msg)?;
    debug!(pid = report.pid, identifier = %report.identifier, "slave reported pid");

    let msg = channel.receive_message().context("waiting for boot result")?;
    parse_boot_report(&msg).map_err(|e| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::supervisor::{StopToken, Supervisor};
    use crate::master::tree::BootState;

    fn fixture() -> (Arc<SlaveNode>, DuplexChannel, JoinHandle<()>) {
        let slave = Arc::new(SlaveNode::new("boot"));
        let (master_end, slave_end) = DuplexChannel::pair().unwrap();
        slave.attach_channel(master_end.try_clone().unwrap());

        let node = Arc::clone(&slave);
        let reader = thread::spawn(move || monitor_slave_channel(&node, master_end));
        (slave, slave_end, reader)
    }

    #[test]
    fn test_ready_slave_delivers_descriptors() {
        let (slave, mut fake, reader) = fixture();
        fake.send_message("P:100:boot").unwrap();
        fake.send_message("R:").unwrap();

        slave.wait_until_booted();
        assert!(slave.error().is_none());

        let (keep, command_end) = UnixStream::pair().unwrap();
        let responder = thread::spawn(move || {
            assert_eq!(fake.receive_message().unwrap(), "C:console:");
            fake.send_descriptor(&command_end).unwrap();
            fake
        });

        slave.request_spawn("console").unwrap();
        let fake = responder.join().unwrap();

        drop(fake);
        reader.join().unwrap();
        assert_eq!(slave.error(), Some("slave boot terminated\n"));
        drop(keep);
    }

    #[test]
    fn test_boot_error_recorded() {
        let (slave, mut fake, reader) = fixture();
        fake.send_message("P:100:boot").unwrap();
        fake.send_message("E:missing Gemfile").unwrap();

        reader.join().unwrap();
        assert_eq!(slave.boot_state(), BootState::Booted);
        assert_eq!(slave.error(), Some("missing Gemfile"));
    }

    #[test]
    fn test_garbled_boot_recorded() {
        let (slave, mut fake, reader) = fixture();
        fake.send_message("hello").unwrap();

        reader.join().unwrap();
        let error = slave.error().unwrap();
        assert!(error.starts_with("slave boot failed to boot"), "{}", error);
    }

    #[test]
    fn test_slave_process_exiting_before_boot() {
        let mut tree = ProcessTree::new();
        let slave = tree.add_slave("boot");
        let monitor = SlaveMonitor::new(Arc::new(tree), "exit 3");

        let supervisor = Supervisor::new().with_subsystem(monitor);
        let exit = supervisor.exit_handle();
        let running = thread::spawn(move || supervisor.run());

        slave.wait_until_booted();
        assert!(slave.error().unwrap().contains("failed to boot"));

        exit.interrupt();
        assert_eq!(running.join().unwrap(), 0);
    }

    #[test]
    fn test_kill_and_reap_leaves_no_zombie() {
        let mut child = Command::new("sh").arg("-c").arg("exec sleep 30").spawn().unwrap();
        let start = Instant::now();

        kill_and_reap(&mut child);

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().unwrap().is_some());
        // Reaped: the pid no longer names one of our children
        assert!(nix::sys::wait::waitpid(Pid::from_raw(child.id() as i32), None).is_err());
    }

    #[test]
    fn test_stop_terminates_running_slave() {
        let mut tree = ProcessTree::new();
        let slave = tree.add_slave("boot");
        let monitor = Box::new(SlaveMonitor::new(Arc::new(tree), "exec sleep 30"));

        let stop = StopToken::new();
        let ctx = SubsystemContext {
            stop: stop.clone(),
            exit: Supervisor::new().exit_handle(),
        };
        let running = thread::spawn(move || monitor.run(ctx));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(slave.boot_state(), BootState::Booting);

        let start = Instant::now();
        stop.stop();
        running.join().unwrap().unwrap();
        assert!(start.elapsed() < SHUTDOWN_TIMEOUT);
        assert!(slave.error().is_some());
    }
}
