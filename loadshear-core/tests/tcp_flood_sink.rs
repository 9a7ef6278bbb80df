//! S1 (spec.md §8): a single shard floods a fixed packet at a pool of sessions against
//! a loopback sink, drains, and disconnects; the sink must see exactly
//! `packet_size * sessions` bytes and no session left connected.

use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use loadshear_core::action::ActionDescriptor;
use loadshear_core::handler::NopHandlerFactory;
use loadshear_core::net::tcp::TcpSession;
use loadshear_core::net::{HostInfo, SessionConfig};
use loadshear_core::payload::{PacketOperation, PayloadDescriptor};
use loadshear_core::{Orchestrator, OrchestratorConfig};

const SESSIONS: u32 = 50;
const PACKET: &[u8] = b"Hello world";

#[test]
fn s1_tcp_flood_single_shard() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback sink");
    let addr = listener.local_addr().unwrap();

    let received = Arc::new(AtomicU64::new(0));
    let received_in_sink = received.clone();
    let sink = thread::spawn(move || {
        let mut accepted = 0;
        let mut handles = Vec::new();
        while accepted < SESSIONS {
            let (mut stream, _) = listener.accept().expect("accept");
            accepted += 1;
            let counter = received_in_sink.clone();
            handles.push(thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            counter.fetch_add(n as u64, Ordering::SeqCst);
                        }
                    }
                }
            }));
        }
        for h in handles {
            let _ = h.join();
        }
    });

    let descriptor = PayloadDescriptor::new(
        PACKET.to_vec(),
        vec![PacketOperation::Identity { length: PACKET.len() as u8 }],
    );

    let actions = vec![
        ActionDescriptor::create(SESSIONS, 0),
        ActionDescriptor::connect(0, SESSIONS, 0),
        ActionDescriptor::flood(0, SESSIONS, 300),
        ActionDescriptor::drain(0, SESSIONS, 5_000, 600),
        ActionDescriptor::disconnect(0, SESSIONS, 1_200),
    ];

    let config = OrchestratorConfig::<TcpSession> {
        session_config: SessionConfig { repeat: false, ..SessionConfig::default() },
        host_info: HostInfo { endpoints: vec![addr] },
        handler_factory: Arc::new(NopHandlerFactory),
        shard_count: 1,
        metrics_sample_interval: Duration::from_millis(200),
    };

    let mut orchestrator = Orchestrator::<TcpSession>::new(
        actions,
        vec![descriptor],
        vec![vec![]],
        config,
        flux::logging::discard(),
    );

    let aggregates = orchestrator.run(Duration::from_millis(200));
    drop(orchestrator);

    sink.join().expect("sink thread");

    // With `repeat=false`, FLOOD makes exactly one pass through the (one-entry) payload
    // catalog per session and then turns itself off, so the sink sees exactly one packet
    // per session, never more, regardless of how long DRAIN takes to land.
    let last = aggregates.last().expect("at least one sample");
    assert_eq!(last.current.finished_connections, SESSIONS as u64);
    let total = received.load(Ordering::SeqCst);
    assert_eq!(total, PACKET.len() as u64 * SESSIONS as u64);
}
