use std::time::Duration;

/// Parameters governing the RDT protocol engine.
///
/// Mirrors the constants of the original `urdt` implementation
/// (`examples/original_source/tunnel.h`, `rxq.h`, `txq.h`).
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum single-datagram payload the carrier is assumed to accept.
    pub mtu: u32,
    /// Advertised receive window, in packets.
    pub window_sz: u32,
    /// Maximum number of tunnels permitted on one (session, channel) pair.
    pub max_tunnels_per_channel: usize,

    /// Base handshake retry interval; the Nth retry waits `handshake_timeout * n`.
    pub handshake_timeout: Duration,
    /// Number of handshake retries before the opener gives up.
    pub handshake_retries: u32,

    /// Keepalive interval while a tunnel is idle in READY.
    pub keepalive_timeout: Duration,
    /// Number of unanswered keepalives tolerated before teardown.
    pub keepalive_retries: u32,

    /// Retransmit timer interval while data is outstanding.
    pub data_ack_timeout: Duration,
    /// Number of retransmit timeouts tolerated before teardown.
    pub data_ack_retries: u32,

    /// Capacity of the receive reassembly queue (packets).
    pub max_rxq_len: usize,
    /// Capacity of the transmit queue (packets).
    pub max_txq_len: usize,
    /// Number of identical cumulative ACKs that trigger a fast resend.
    pub resend_trigger_count: u32,

    /// Microsecond coefficient of the TxQ back-pressure placeholder: each
    /// `send_data` sleeps `tx_backpressure_factor_us * queue_len^2` µs after
    /// enqueueing, standing in for real congestion control. Set to 0 to
    /// disable, as tests do.
    pub tx_backpressure_factor_us: u64,

    /// Current protocol version (low 6 bits of the handshake version field).
    pub version: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: 1500,
            window_sz: 255,
            max_tunnels_per_channel: 5,

            handshake_timeout: Duration::from_secs(2),
            handshake_retries: 3,

            keepalive_timeout: Duration::from_secs(45),
            keepalive_retries: 9,

            data_ack_timeout: Duration::from_secs(1),
            data_ack_retries: 90,

            max_rxq_len: 255,
            max_txq_len: 1024,
            resend_trigger_count: 3,
            tx_backpressure_factor_us: 10,

            version: 1,
        }
    }
}

impl Config {
    /// Bound on the time an active `open()` call may block before giving up,
    /// `handshake_timeout * handshake_retries * 2` as in the original
    /// `TUNNEL_OPEN_TIMEOUT` (two full retry ladders: one for the REQ, one
    /// for the FIN leg).
    pub fn tunnel_open_timeout(&self) -> Duration {
        self.handshake_timeout * self.handshake_retries * 2
    }
}

/// Handshake magic prefixing every HANDSHAKE_REQ datagram.
pub const HANDSHAKE_REQ_MAGIC: u32 = 0xB532_A79B;

/// Magic prefix recognized by the port-forwarding hook.
pub const PORT_FORWARD_MAGIC: u32 = 0xA29B_F88E;

/// Total length of a port-forwarding-latch DATA payload.
pub const PORT_FORWARD_LEN: usize = 12;
