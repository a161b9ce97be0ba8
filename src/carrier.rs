//! The carrier contract: the unreliable session/channel transport RDT is
//! layered over. Establishing that transport (sockets, actual delivery) is
//! out of scope here — this module defines the interface only, plus an
//! in-memory test double.

use bytes::Bytes;

/// External collaborator: an unreliable, message-oriented transport that
/// RDT multiplexes tunnels onto by (session_id, channel_id).
///
/// Implementations may block in `write`; RDT's dispatcher threads are
/// designed to tolerate that.
pub trait Carrier: Send + Sync {
    /// Blocking write of one datagram.
    fn session_write(&self, session_id: i32, channel_id: i32, buf: Bytes);

    /// Enable or disable delivery of inbound datagrams for a (session,
    /// channel) pair. Called when the first/last tunnel on that pair is
    /// registered/unregistered.
    fn session_set_hook(&self, session_id: i32, channel_id: i32, enable: bool);
}

/// An in-process carrier for wiring two `RdtContext`s together without a
/// real socket, delivering writes straight to a registered peer callback.
/// Kept as an ordinary module, not behind `#[cfg(test)]`, so integration
/// tests under `tests/` can use it too.
pub mod loopback {
    use super::*;
    use std::sync::{Arc, Mutex};

    pub struct LoopbackCarrier {
        peer: Mutex<Option<Box<dyn Fn(i32, i32, Bytes) + Send + Sync>>>,
        pub hooked: Mutex<bool>,
        pub drop_next: Mutex<usize>,
        swap_armed: Mutex<bool>,
        held: Mutex<Option<(i32, i32, Bytes)>>,
    }

    impl LoopbackCarrier {
        pub fn new() -> Arc<Self> {
            Arc::new(LoopbackCarrier {
                peer: Mutex::new(None),
                hooked: Mutex::new(false),
                drop_next: Mutex::new(0),
                swap_armed: Mutex::new(false),
                held: Mutex::new(None),
            })
        }

        pub fn set_peer(&self, cb: impl Fn(i32, i32, Bytes) + Send + Sync + 'static) {
            *self.peer.lock().unwrap() = Some(Box::new(cb));
        }

        /// Drop the next `n` writes, simulating carrier loss.
        pub fn drop_next(&self, n: usize) {
            *self.drop_next.lock().unwrap() = n;
        }

        /// Deliver the next two writes in reverse order, simulating network
        /// reordering of two in-flight datagrams.
        pub fn swap_next_two(&self) {
            *self.swap_armed.lock().unwrap() = true;
        }
    }

    impl Carrier for LoopbackCarrier {
        fn session_write(&self, session_id: i32, channel_id: i32, buf: Bytes) {
            {
                let mut n = self.drop_next.lock().unwrap();
                if *n > 0 {
                    *n -= 1;
                    return;
                }
            }
            if *self.swap_armed.lock().unwrap() {
                let mut held = self.held.lock().unwrap();
                if held.is_none() {
                    *held = Some((session_id, channel_id, buf));
                    return;
                }
                *self.swap_armed.lock().unwrap() = false;
                let (hs, hc, hbuf) = held.take().unwrap();
                drop(held);
                if let Some(cb) = self.peer.lock().unwrap().as_ref() {
                    cb(session_id, channel_id, buf);
                    cb(hs, hc, hbuf);
                }
                return;
            }
            if let Some(cb) = self.peer.lock().unwrap().as_ref() {
                cb(session_id, channel_id, buf);
            }
        }

        fn session_set_hook(&self, _session_id: i32, _channel_id: i32, enable: bool) {
            *self.hooked.lock().unwrap() = enable;
        }
    }
}
