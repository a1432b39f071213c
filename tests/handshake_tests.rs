use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use zeus::error::{ChannelError, HandshakeError};
use zeus::master::protocol::{create_pid, parse_spawn_command};
use zeus::master::slave_monitor::monitor_slave_channel;
use zeus::master::{run_handshake, DuplexChannel, HandshakeOutcome, ProcessTree, SlaveNode};

// ---------------------------------------------------------------------------
// Fake slave and command processes
// ---------------------------------------------------------------------------

/// What the fake command processes observed
#[derive(Default)]
struct Observed {
    spawn_requests: Mutex<Vec<String>>,
    arguments: Mutex<Vec<String>>,
}

/// A slave that answers each `C:` request with a socket to a fake command
/// process. The command process reads its arguments and terminal, writes
/// `hello from <command>` to the terminal, reports its pid, and exits with
/// `exit_status`.
fn start_fake_slave(
    slave: &Arc<SlaveNode>,
    first_pid: i32,
    exit_status: &'static str,
    observed: Arc<Observed>,
) -> JoinHandle<()> {
    let (master_end, mut slave_end) = DuplexChannel::pair().unwrap();
    slave.attach_channel(master_end.try_clone().unwrap());

    let node = Arc::clone(slave);
    thread::spawn(move || monitor_slave_channel(&node, master_end));

    let identifier = slave.identifier().to_string();
    thread::spawn(move || {
        let next_pid = AtomicI32::new(first_pid);
        slave_end.send_message(&create_pid(1, &identifier)).unwrap();
        slave_end.send_message("R:").unwrap();

        while let Ok(msg) = slave_end.receive_message() {
            let command = parse_spawn_command(&msg).unwrap().to_string();
            observed.spawn_requests.lock().unwrap().push(command.clone());

            let (master_side, process_side) = DuplexChannel::pair().unwrap();
            slave_end.send_descriptor(&master_side).unwrap();
            drop(master_side);

            let pid = next_pid.fetch_add(1, Ordering::SeqCst);
            let observed = Arc::clone(&observed);
            thread::spawn(move || {
                run_fake_command(process_side, &command, pid, exit_status, &observed)
            });
        }
    })
}

fn run_fake_command(
    mut channel: DuplexChannel,
    command: &str,
    pid: i32,
    exit_status: &str,
    observed: &Observed,
) {
    let arguments = channel.receive_message().unwrap();
    observed.arguments.lock().unwrap().push(arguments);

    let terminal = channel.receive_descriptor().unwrap();
    let mut terminal = std::fs::File::from(terminal);
    terminal
        .write_all(format!("hello from {}", command).as_bytes())
        .unwrap();
    drop(terminal);

    channel.send_message(&create_pid(pid, command)).unwrap();
    channel.send_message(exit_status).unwrap();
}

// ---------------------------------------------------------------------------
// Client helpers
// ---------------------------------------------------------------------------

struct Client {
    channel: DuplexChannel,
    terminal: UnixStream,
    handler: JoinHandle<Result<HandshakeOutcome, HandshakeError>>,
}

/// Connect a client to a handler running on its own thread
fn connect(tree: &Arc<ProcessTree>) -> (DuplexChannel, JoinHandle<Result<HandshakeOutcome, HandshakeError>>) {
    let (client, server) = DuplexChannel::pair().unwrap();
    let tree = Arc::clone(tree);
    let handler = thread::spawn(move || run_handshake(&tree, server));
    (client, handler)
}

/// Send a request plus a fresh terminal descriptor
fn request(tree: &Arc<ProcessTree>, command: &str, arguments: &str) -> Client {
    let (mut channel, handler) = connect(tree);
    let (terminal, passed) = UnixStream::pair().unwrap();
    terminal
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    channel
        .send_message(&format!("Q:{}:{}", command, arguments))
        .unwrap();
    channel.send_descriptor(&passed).unwrap();
    drop(passed);

    Client {
        channel,
        terminal,
        handler,
    }
}

fn read_terminal(terminal: &mut UnixStream, len: usize) -> String {
    let mut buf = vec![0u8; len];
    terminal.read_exact(&mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}

fn tree_with_command(
    slave: &str,
    command: &str,
    aliases: &[&str],
) -> (Arc<ProcessTree>, Arc<SlaveNode>) {
    let mut tree = ProcessTree::new();
    let node = tree.add_slave(slave);
    tree.add_command(
        command,
        aliases.iter().map(|a| a.to_string()).collect(),
        &node,
    )
    .unwrap();
    (Arc::new(tree), node)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_successful_handshake_relays_pid_and_status() {
    let (tree, slave) = tree_with_command("test_helper", "run_tests", &[]);
    let observed = Arc::new(Observed::default());
    start_fake_slave(&slave, 4242, "0", Arc::clone(&observed));

    let mut client = request(&tree, "run_tests", "--fast spec/models");

    assert_eq!(client.channel.receive_message().unwrap(), "4242");
    assert_eq!(client.channel.receive_message().unwrap(), "0");
    assert_eq!(
        read_terminal(&mut client.terminal, "hello from run_tests".len()),
        "hello from run_tests"
    );

    let outcome = client.handler.join().unwrap().unwrap();
    assert_eq!(
        outcome,
        HandshakeOutcome::Spawned {
            pid: 4242,
            exit_status: "0".to_string()
        }
    );
    assert_eq!(*observed.spawn_requests.lock().unwrap(), vec!["run_tests"]);
    assert_eq!(*observed.arguments.lock().unwrap(), vec!["--fast spec/models"]);

    // Handler closed its side once the exit status was relayed
    assert!(matches!(
        client.channel.receive_message(),
        Err(ChannelError::Closed)
    ));
}

#[test]
fn test_exit_status_forwarded_verbatim() {
    let (tree, slave) = tree_with_command("boot", "rake", &[]);
    start_fake_slave(&slave, 77, "130", Arc::new(Observed::default()));

    let mut client = request(&tree, "rake", "db:migrate");
    assert_eq!(client.channel.receive_message().unwrap(), "77");
    assert_eq!(client.channel.receive_message().unwrap(), "130");
    client.handler.join().unwrap().unwrap();
}

#[test]
fn test_unknown_command_closes_without_response() {
    let (tree, _slave) = tree_with_command("test_helper", "run_tests", &[]);

    let mut client = request(&tree, "deploy", "");

    let result = client.handler.join().unwrap();
    assert!(matches!(result, Err(HandshakeError::UnknownCommand(ref c)) if c == "deploy"));
    assert!(matches!(
        client.channel.receive_message(),
        Err(ChannelError::Closed)
    ));

    // The terminal queued on the closed connection was released with it
    let mut buf = [0u8; 1];
    assert_eq!(client.terminal.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_slave_boot_error_reported_to_client() {
    let (tree, slave) = tree_with_command("default_bundle", "build", &[]);
    slave.record_error("missing Gemfile");

    let mut client = request(&tree, "build", "");

    assert_eq!(client.channel.receive_message().unwrap(), "0");
    assert_eq!(
        read_terminal(&mut client.terminal, "missing Gemfile".len()),
        "missing Gemfile"
    );
    assert_eq!(client.channel.receive_message().unwrap(), "1");
    assert_eq!(
        client.handler.join().unwrap().unwrap(),
        HandshakeOutcome::SlaveError
    );
}

#[test]
fn test_malformed_request_closes_connection() {
    let (tree, _slave) = tree_with_command("boot", "console", &[]);
    let (mut client, handler) = connect(&tree);

    client.send_message("hello").unwrap();

    assert!(matches!(
        handler.join().unwrap(),
        Err(HandshakeError::Protocol(_))
    ));
    assert!(matches!(client.receive_message(), Err(ChannelError::Closed)));
}

#[test]
fn test_missing_terminal_descriptor_aborts() {
    let (tree, slave) = tree_with_command("boot", "console", &[]);
    let observed = Arc::new(Observed::default());
    start_fake_slave(&slave, 10, "0", Arc::clone(&observed));
    let (mut client, handler) = connect(&tree);

    client.send_message("Q:console:").unwrap();
    client.send_message("not a descriptor").unwrap();

    assert!(matches!(
        handler.join().unwrap(),
        Err(HandshakeError::Channel {
            source: ChannelError::NoDescriptor,
            ..
        })
    ));
    assert!(matches!(client.receive_message(), Err(ChannelError::Closed)));
    assert!(observed.spawn_requests.lock().unwrap().is_empty());
}

#[test]
fn test_alias_spawns_canonical_command() {
    let (tree, slave) = tree_with_command("test_helper", "test", &["rspec", "testrb"]);
    let observed = Arc::new(Observed::default());
    start_fake_slave(&slave, 500, "0", Arc::clone(&observed));

    let mut client = request(&tree, "rspec", "spec/user_spec.rb");
    assert_eq!(client.channel.receive_message().unwrap(), "500");
    assert_eq!(client.channel.receive_message().unwrap(), "0");
    client.handler.join().unwrap().unwrap();

    assert_eq!(*observed.spawn_requests.lock().unwrap(), vec!["test"]);
}

#[test]
fn test_handshake_waits_for_boot() {
    let (tree, slave) = tree_with_command("boot", "console", &[]);
    let mut client = request(&tree, "console", "");

    thread::sleep(Duration::from_millis(100));
    assert!(!client.handler.is_finished());

    start_fake_slave(&slave, 321, "0", Arc::new(Observed::default()));
    assert_eq!(client.channel.receive_message().unwrap(), "321");
    assert_eq!(client.channel.receive_message().unwrap(), "0");
    client.handler.join().unwrap().unwrap();
}

#[test]
fn test_concurrent_handshakes_on_one_slave() {
    let (tree, slave) = tree_with_command("development_environment", "console", &[]);
    let observed = Arc::new(Observed::default());
    start_fake_slave(&slave, 1001, "0", Arc::clone(&observed));

    let clients: Vec<Client> = (0..4)
        .map(|i| request(&tree, "console", &format!("session-{}", i)))
        .collect();

    let mut pids: Vec<String> = clients
        .into_iter()
        .map(|mut client| {
            let pid = client.channel.receive_message().unwrap();
            assert_eq!(client.channel.receive_message().unwrap(), "0");
            assert_eq!(
                read_terminal(&mut client.terminal, "hello from console".len()),
                "hello from console"
            );
            client.handler.join().unwrap().unwrap();
            pid
        })
        .collect();
    pids.sort();

    assert_eq!(pids, vec!["1001", "1002", "1003", "1004"]);
    assert_eq!(observed.spawn_requests.lock().unwrap().len(), 4);
}

#[test]
fn test_failed_connection_does_not_affect_others() {
    let (tree, slave) = tree_with_command("boot", "console", &[]);
    start_fake_slave(&slave, 600, "0", Arc::new(Observed::default()));

    let (mut bad, bad_handler) = connect(&tree);
    bad.send_message("Q:console:").unwrap();
    drop(bad);

    let mut good = request(&tree, "console", "");
    assert_eq!(good.channel.receive_message().unwrap(), "600");
    assert_eq!(good.channel.receive_message().unwrap(), "0");
    good.handler.join().unwrap().unwrap();

    assert!(bad_handler.join().unwrap().is_err());
}

#[test]
fn test_dead_slave_reported_as_error() {
    let (tree, slave) = tree_with_command("boot", "console", &[]);
    let (master_end, mut slave_end) = DuplexChannel::pair().unwrap();
    slave.attach_channel(master_end.try_clone().unwrap());
    let node = Arc::clone(&slave);
    let reader = thread::spawn(move || monitor_slave_channel(&node, master_end));

    slave_end.send_message("P:1:boot").unwrap();
    slave_end.send_message("R:").unwrap();
    drop(slave_end);
    reader.join().unwrap();

    let mut client = request(&tree, "console", "");
    assert_eq!(client.channel.receive_message().unwrap(), "0");
    assert_eq!(
        read_terminal(&mut client.terminal, "slave boot terminated\n".len()),
        "slave boot terminated\n"
    );
    assert_eq!(client.channel.receive_message().unwrap(), "1");
    client.handler.join().unwrap().unwrap();
}

#[test]
fn test_slave_dying_mid_spawn_aborts_handshake() {
    let (tree, slave) = tree_with_command("boot", "console", &[]);
    let (master_end, mut slave_end) = DuplexChannel::pair().unwrap();
    slave.attach_channel(master_end.try_clone().unwrap());
    let node = Arc::clone(&slave);
    thread::spawn(move || monitor_slave_channel(&node, master_end));

    slave_end.send_message("P:1:boot").unwrap();
    slave_end.send_message("R:").unwrap();

    let mut client = request(&tree, "console", "");
    assert_eq!(slave_end.receive_message().unwrap(), "C:console:");
    drop(slave_end);

    assert!(matches!(
        client.handler.join().unwrap(),
        Err(HandshakeError::SlaveUnavailable(_))
    ));
    assert!(matches!(
        client.channel.receive_message(),
        Err(ChannelError::Closed)
    ));
}

#[test]
fn test_handler_finishes_promptly() {
    let (tree, slave) = tree_with_command("boot", "console", &[]);
    start_fake_slave(&slave, 42, "0", Arc::new(Observed::default()));

    let start = Instant::now();
    let mut client = request(&tree, "console", "");
    client.channel.receive_message().unwrap();
    client.channel.receive_message().unwrap();
    client.handler.join().unwrap().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
}
