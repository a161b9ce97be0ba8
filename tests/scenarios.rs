//! End-to-end scenario tests, black-box against the public API: two
//! `RdtContext`s wired through a shared `LoopbackCarrier` rather than real
//! sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use rdt::carrier::loopback::LoopbackCarrier;
use rdt::{Config, Handler, RdtContext};

fn logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn fast_config() -> Config {
    let mut c = Config::default();
    c.tx_backpressure_factor_us = 0;
    c
}

/// Records every `on_data` payload and whether `on_closed` fired.
struct Recorder {
    data: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Recorder {
            data: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn handler(self: &Arc<Self>) -> Handler {
        let data_sink = Arc::clone(self);
        let closed_sink = Arc::clone(self);
        Handler {
            on_data: Box::new(move |buf| data_sink.data.lock().unwrap().push(buf.to_vec())),
            on_closed: Box::new(move |_handle, _reason| closed_sink.closed.store(true, Ordering::SeqCst)),
        }
    }
}

fn null_handler() -> Handler {
    Handler {
        on_data: Box::new(|_| {}),
        on_closed: Box::new(|_, _| {}),
    }
}

/// Wire two contexts back to back over a pair of loopback carriers. `b`
/// accepts every inbound handshake and attaches a recorder's handler.
/// Returns both contexts, both carriers, and B's recorder.
fn wire(config: Config) -> (Arc<RdtContext>, Arc<RdtContext>, Arc<LoopbackCarrier>, Arc<LoopbackCarrier>, Arc<Recorder>) {
    let carrier_a = LoopbackCarrier::new();
    let carrier_b = LoopbackCarrier::new();
    let b_recorder = Recorder::new();
    let accept_recorder = Arc::clone(&b_recorder);

    let b = Arc::new(RdtContext::new(
        logger(),
        config.clone(),
        carrier_b.clone(),
        Box::new(move |_s, _c, _h| Some(accept_recorder.handler())),
    ));
    let a = Arc::new(RdtContext::new(
        logger(),
        config,
        carrier_a.clone(),
        Box::new(|_, _, _| None),
    ));

    let b2 = Arc::clone(&b);
    let a2 = Arc::clone(&a);
    carrier_a.set_peer(move |s, c, buf| b2.dispatch(s, c, buf));
    carrier_b.set_peer(move |s, c, buf| a2.dispatch(s, c, buf));

    (a, b, carrier_a, carrier_b, b_recorder)
}

/// Scenario 1: clean open + write + close.
#[test]
fn clean_open_write_close() {
    let (a, b, _ca, _cb, b_recorder) = wire(fast_config());

    let a_recorder = Recorder::new();
    let handle = a
        .open(1, 1, a_recorder.handler())
        .expect("handshake should complete");

    a.write(handle, b"hello").unwrap();
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(b_recorder.data.lock().unwrap().as_slice(), &[b"hello".to_vec()]);

    let info_a = a.get_info(handle).unwrap();
    assert_eq!(info_a.bytes_of_sent, 5);
    assert_eq!(info_a.bytes_of_received, 0);

    a.close(handle).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(b_recorder.closed.load(Ordering::SeqCst));

    let _ = b;
}

/// Scenario 2: handshake retry. A's first two REQs vanish; the third gets
/// through and the handshake completes within the retry ladder.
#[test]
fn handshake_retry_then_success() {
    let mut config = fast_config();
    config.handshake_timeout = Duration::from_millis(20);
    config.handshake_retries = 5;
    let (a, _b, carrier_a, _cb, _b_recorder) = wire(config);
    carrier_a.drop_next(2);

    let result = a.open(1, 1, null_handler());
    assert!(result.is_ok(), "handshake should survive two dropped REQs");
}

/// Scenario 2 continued: every REQ is lost, so the retry ladder exhausts and
/// `open` reports failure, with no tunnel left registered.
#[test]
fn handshake_retry_exhausted_fails() {
    let carrier_a = LoopbackCarrier::new();
    let mut config = fast_config();
    config.handshake_timeout = Duration::from_millis(10);
    config.handshake_retries = 3;
    let a = RdtContext::new(logger(), config, carrier_a, Box::new(|_, _, _| None));

    let result = a.open(1, 1, null_handler());
    assert!(result.is_err());
}

/// Scenario 3: out-of-order data. The datagram for the middle chunk (seq=5)
/// is reordered to arrive after the last chunk (seq=9); B's reassembly queue
/// still commits all three chunks, contiguously and in order, once the gap
/// is filled.
#[test]
fn out_of_order_data_reassembles() {
    let (a, b, carrier_a, _cb, b_recorder) = wire(fast_config());
    let handle = a.open(1, 1, null_handler()).expect("handshake should complete");

    a.write(handle, b"abcd").unwrap(); // seq=1
    std::thread::sleep(Duration::from_millis(50)); // let seq=1 drain before arming the swap

    carrier_a.swap_next_two();
    a.write(handle, b"ijkl").unwrap(); // seq=5, delivered second
    a.write(handle, b"wxyz").unwrap(); // seq=9, delivered first

    std::thread::sleep(Duration::from_millis(150));

    let delivered = b_recorder.data.lock().unwrap().clone();
    assert_eq!(delivered, vec![b"abcd".to_vec(), b"ijkl".to_vec(), b"wxyz".to_vec()]);

    let _ = b;
}

/// Scenario 4: fast retransmit. One DATA datagram (seq=5) is lost; three
/// identical duplicate ACKs from B (each still acking seq=5) trigger A to
/// resend it, after which B can commit everything held behind the gap.
#[test]
fn fast_retransmit_on_triple_duplicate_ack() {
    let mut config = fast_config();
    config.resend_trigger_count = 3;
    config.data_ack_timeout = Duration::from_secs(30); // keep the slow retransmit timer out of the way
    let (a, b, carrier_a, _cb, b_recorder) = wire(config);
    let handle = a.open(1, 1, null_handler()).expect("handshake should complete");

    a.write(handle, b"abcd").unwrap(); // seq=1, delivered
    std::thread::sleep(Duration::from_millis(50));

    carrier_a.drop_next(1);
    a.write(handle, b"ijkl").unwrap(); // seq=5, lost on the wire
    // Each of these lands behind the gap; every one re-ACKs the unmet
    // expected_seq (5). The first such ACK advances TxQ's `last_ack` from
    // its initial 0 to 5; the next three are genuine duplicates, and the
    // third of those (four ACK(5)s in total) trips `resend_trigger_count`.
    a.write(handle, b"wxyz").unwrap(); // seq=9
    a.write(handle, b"0123").unwrap(); // seq=13
    a.write(handle, b"4567").unwrap(); // seq=17
    a.write(handle, b"89ab").unwrap(); // seq=21

    std::thread::sleep(Duration::from_millis(400));

    let delivered = b_recorder.data.lock().unwrap().clone();
    assert_eq!(
        delivered,
        vec![
            b"abcd".to_vec(),
            b"ijkl".to_vec(),
            b"wxyz".to_vec(),
            b"0123".to_vec(),
            b"4567".to_vec(),
            b"89ab".to_vec(),
        ]
    );

    let _ = b;
}

/// Scenario 5: keepalive + shutdown. A blackholed carrier means A's
/// keepalives go unanswered; once the retry budget is exhausted A destroys
/// the tunnel itself.
#[test]
fn keepalive_exhaustion_destroys_idle_tunnel() {
    let mut config = fast_config();
    config.keepalive_timeout = Duration::from_millis(15);
    config.keepalive_retries = 3;
    let (a, _b, carrier_a, _cb, _b_recorder) = wire(config);

    let a_recorder = Recorder::new();
    let handle = a
        .open(1, 1, a_recorder.handler())
        .expect("handshake should complete");

    // Simulate the cable being unplugged: A's outbound keepalives now reach
    // nobody, so no DATA_ACK/KEEPALIVE ever resets its timeout_counter.
    carrier_a.set_peer(|_, _, _| {});

    std::thread::sleep(Duration::from_millis(15 * 4 + 100));

    assert!(a.get_info(handle).is_err(), "tunnel should be torn down after keepalive retries are exhausted");
    assert!(a_recorder.closed.load(Ordering::SeqCst));
}

/// Scenario 5, happy path: answered keepalives keep an idle tunnel alive
/// past one interval.
#[test]
fn keepalive_answered_keeps_tunnel_alive() {
    let mut config = fast_config();
    config.keepalive_timeout = Duration::from_millis(20);
    config.keepalive_retries = 5;
    let (a, _b, _ca, _cb, _b_recorder) = wire(config);

    let handle = a.open(1, 1, null_handler()).expect("handshake should complete");
    std::thread::sleep(Duration::from_millis(100));

    assert!(a.get_info(handle).is_ok(), "answered keepalives must not tear the tunnel down");
}

/// Scenario 6: port-forwarding latch. The first DATA payload on a tunnel
/// matching the forwarding magic latches that tunnel into forwarding mode;
/// it and all later payloads go to the hook instead of `onData`.
#[test]
fn port_forward_latch_diverts_from_on_data() {
    let (a, b, _ca, _cb, b_recorder) = wire(fast_config());
    let handle = a.open(1, 1, null_handler()).expect("handshake should complete");

    let forwarded: Arc<Mutex<Vec<(u16, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&forwarded);
    b.set_forward_hook(Some(Box::new(move |teid, data| {
        sink.lock().unwrap().push((teid, data.to_vec()));
    })));

    let mut latch_payload = vec![0u8; 12];
    BigEndian::write_u32(&mut latch_payload[0..4], 0xA29B_F88E);
    latch_payload[4..].copy_from_slice(&[7u8; 8]);

    a.write(handle, &latch_payload).unwrap();
    a.write(handle, b"after-latch!").unwrap(); // 12 bytes, no magic: still forwarded once latched

    std::thread::sleep(Duration::from_millis(150));

    assert!(b_recorder.data.lock().unwrap().is_empty(), "on_data must not see latched payloads");
    let fwd = forwarded.lock().unwrap();
    assert_eq!(fwd.len(), 2);
    assert_eq!(fwd[0].1, latch_payload);
    assert_eq!(fwd[1].1, b"after-latch!".to_vec());
}
