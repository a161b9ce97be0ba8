//! Optional port-forwarding hook.
//!
//! A process-wide callback that siphons data away from the application's
//! `onData` once a tunnel's first DATA payload matches the forwarding
//! magic. Latching is per-tunnel and, once set, sticky for the tunnel's
//! lifetime.

use crate::config::{PORT_FORWARD_LEN, PORT_FORWARD_MAGIC};
use byteorder::{BigEndian, ByteOrder};

pub type ForwardHook = Box<dyn Fn(u16, &[u8]) + Send + Sync>;

/// Whether `payload` should latch a tunnel into port-forwarding mode: it
/// begins with the magic and is exactly `PORT_FORWARD_LEN` bytes long.
pub fn is_latch_payload(payload: &[u8]) -> bool {
    payload.len() == PORT_FORWARD_LEN
        && payload.len() >= 4
        && BigEndian::read_u32(&payload[0..4]) == PORT_FORWARD_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_latch_payload() {
        let mut buf = vec![0u8; PORT_FORWARD_LEN];
        BigEndian::write_u32(&mut buf[0..4], PORT_FORWARD_MAGIC);
        assert!(is_latch_payload(&buf));
    }

    #[test]
    fn rejects_wrong_length() {
        let mut buf = vec![0u8; PORT_FORWARD_LEN + 1];
        BigEndian::write_u32(&mut buf[0..4], PORT_FORWARD_MAGIC);
        assert!(!is_latch_payload(&buf));
    }

    #[test]
    fn rejects_wrong_magic() {
        let buf = vec![0u8; PORT_FORWARD_LEN];
        assert!(!is_latch_payload(&buf));
    }
}
