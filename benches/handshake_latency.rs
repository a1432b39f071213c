use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use zeus::master::protocol::create_pid;
use zeus::master::slave_monitor::monitor_slave_channel;
use zeus::master::{run_handshake, DuplexChannel, ProcessTree};

// ---------------------------------------------------------------------------
// Channel primitives
// ---------------------------------------------------------------------------

fn bench_message_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_round_trip");

    for size in [16usize, 1024, 64 * 1024] {
        let (mut a, mut b) = DuplexChannel::pair().unwrap();
        let echo = thread::spawn(move || {
            while let Ok(msg) = b.receive_message() {
                if b.send_message(&msg).is_err() {
                    break;
                }
            }
        });

        let payload = "x".repeat(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |bench, payload| {
            bench.iter(|| {
                a.send_message(black_box(payload)).unwrap();
                black_box(a.receive_message().unwrap());
            })
        });

        drop(a);
        echo.join().unwrap();
    }

    group.finish();
}

fn bench_descriptor_transfer(c: &mut Criterion) {
    let (a, b) = DuplexChannel::pair().unwrap();
    let (_keep, passed) = UnixStream::pair().unwrap();

    c.bench_function("descriptor_transfer", |bench| {
        bench.iter(|| {
            a.send_descriptor(&passed).unwrap();
            black_box(b.receive_descriptor().unwrap());
        })
    });
}

// ---------------------------------------------------------------------------
// Full client handshake against an in-process slave
// ---------------------------------------------------------------------------

fn bench_full_handshake(c: &mut Criterion) {
    let mut tree = ProcessTree::new();
    let slave = tree.add_slave("test_helper");
    tree.add_command("run_tests", Vec::new(), &slave).unwrap();
    let tree = Arc::new(tree);

    let (master_end, mut slave_end) = DuplexChannel::pair().unwrap();
    slave.attach_channel(master_end.try_clone().unwrap());
    let node = Arc::clone(&slave);
    thread::spawn(move || monitor_slave_channel(&node, master_end));

    thread::spawn(move || {
        slave_end.send_message(&create_pid(1, "test_helper")).unwrap();
        slave_end.send_message("R:").unwrap();
        while slave_end.receive_message().is_ok() {
            let (master_side, mut process) = DuplexChannel::pair().unwrap();
            if slave_end.send_descriptor(&master_side).is_err() {
                break;
            }
            drop(master_side);
            thread::spawn(move || {
                let _arguments = process.receive_message().unwrap();
                let _terminal = process.receive_descriptor().unwrap();
                process.send_message(&create_pid(4242, "run_tests")).unwrap();
                process.send_message("0").unwrap();
            });
        }
    });
    slave.wait_until_booted();

    c.bench_function("full_handshake", |bench| {
        bench.iter(|| {
            let (mut client, server) = DuplexChannel::pair().unwrap();
            let (_terminal, passed) = UnixStream::pair().unwrap();

            client.send_message("Q:run_tests:--fast").unwrap();
            client.send_descriptor(&passed).unwrap();
            drop(passed);

            run_handshake(&tree, server).unwrap();
            black_box(client.receive_message().unwrap());
            black_box(client.receive_message().unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_message_round_trip,
    bench_descriptor_transfer,
    bench_full_handshake
);
criterion_main!(benches);
