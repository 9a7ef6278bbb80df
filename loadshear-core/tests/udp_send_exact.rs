//! A fixed-count SEND against a loopback UDP sink: unlike FLOOD, `copies` bounds exactly
//! how many datagrams each session emits, so the total is deterministic (spec.md §8
//! property 5, "at-most-one-write in flight", combined with the SEND-targets-one-packet
//! fix in `net::mod::SessionOps::send`).

use std::net::UdpSocket as StdUdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use loadshear_core::action::ActionDescriptor;
use loadshear_core::handler::NopHandlerFactory;
use loadshear_core::net::udp::UdpSession;
use loadshear_core::net::{HostInfo, SessionConfig};
use loadshear_core::payload::{PacketOperation, PayloadDescriptor};
use loadshear_core::{Orchestrator, OrchestratorConfig};

const SESSIONS: u32 = 4;
const COPIES: u32 = 3;
const PACKET: &[u8] = b"Hello world";

#[test]
fn udp_send_emits_exactly_copies_times_sessions_datagrams() {
    let sink = StdUdpSocket::bind("127.0.0.1:0").expect("bind udp sink");
    let addr = sink.local_addr().unwrap();
    sink.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let received = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let mut total = 0u64;
        let mut datagrams = 0u64;
        let expected = (SESSIONS * COPIES) as u64;
        while datagrams < expected {
            match sink.recv(&mut buf) {
                Ok(n) => {
                    total += n as u64;
                    datagrams += 1;
                }
                Err(_) => break,
            }
        }
        (total, datagrams)
    });

    let descriptor = PayloadDescriptor::new(
        PACKET.to_vec(),
        vec![PacketOperation::Identity { length: PACKET.len() as u8 }],
    );

    let actions = vec![
        ActionDescriptor::create(SESSIONS, 0),
        ActionDescriptor::connect(0, SESSIONS, 0),
        ActionDescriptor::send(0, SESSIONS, COPIES, 0, 100),
        ActionDescriptor::disconnect(0, SESSIONS, 800),
    ];

    let config = OrchestratorConfig::<UdpSession> {
        session_config: SessionConfig::default(),
        host_info: HostInfo { endpoints: vec![addr] },
        handler_factory: Arc::new(NopHandlerFactory),
        shard_count: 1,
        metrics_sample_interval: Duration::from_millis(200),
    };

    let mut orchestrator = Orchestrator::<UdpSession>::new(
        actions,
        vec![descriptor],
        vec![vec![]],
        config,
        flux::logging::discard(),
    );

    let aggregates = orchestrator.run(Duration::from_millis(200));
    drop(orchestrator);

    let (total, datagrams) = received.join().expect("sink thread");

    let last = aggregates.last().expect("at least one sample");
    assert_eq!(last.current.finished_connections, SESSIONS as u64);
    assert_eq!(datagrams, (SESSIONS * COPIES) as u64);
    assert_eq!(total, PACKET.len() as u64 * (SESSIONS * COPIES) as u64);
}
