//! Reliable Data Tunnel: an ordered, reliable byte tunnel multiplexed over
//! an unreliable, message-oriented carrier (session/channel pairs).
//!
//! [`RdtContext`] is the module's one piece of global state, made an owned,
//! independently-constructible value rather than a process-wide singleton:
//! tests can stand up as many as they like. Constructing one installs the
//! carrier and the upward open callback; dropping it, or calling
//! [`RdtContext::shutdown`] explicitly, tears down every live tunnel. Because
//! each instance owns its state, there is no "already started" or "not
//! started" condition to track — Rust's ownership rules those out.

#[macro_use]
extern crate slog;

pub mod carrier;
pub mod codec;
pub mod config;
pub mod error;
pub mod forward;
mod manager;
mod ops;
pub mod rxq;
mod state;
pub mod tunnel;
pub mod txq;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use slog::Logger;

pub use config::Config;
pub use error::{RdtError, Result};
pub use manager::{OpenedCallback, TunnelInfo};
pub use tunnel::{Handler, TunnelHandle};

use carrier::Carrier;
use manager::TunnelManager;
use state::TunnelState;

/// A running RDT module instance, bound to one carrier.
pub struct RdtContext {
    manager: Arc<TunnelManager>,
}

impl RdtContext {
    /// Install the carrier and the upward callback invoked when an inbound
    /// handshake completes.
    pub fn new(
        log: Logger,
        config: Config,
        carrier: Arc<dyn Carrier>,
        on_rdt_opened: OpenedCallback,
    ) -> Self {
        RdtContext {
            manager: TunnelManager::new(log, Arc::new(config), carrier, on_rdt_opened),
        }
    }

    /// Install or clear the process-wide port-forwarding hook.
    pub fn set_forward_hook(&self, hook: Option<forward::ForwardHook>) {
        self.manager.set_forward_hook(hook);
    }

    /// Feed one inbound datagram for `(session_id, channel_id)` to the
    /// engine. The carrier integration is expected to call this from its
    /// own registered receive callback.
    pub fn dispatch(&self, session_id: i32, channel_id: i32, buf: Bytes) {
        self.manager.dispatch(session_id, channel_id, buf);
    }

    /// Active open: allocate a tunnel, send HANDSHAKE_REQ, and block until
    /// the handshake completes or
    /// [`Config::tunnel_open_timeout`] elapses. On any failure the tunnel is
    /// torn down before returning.
    pub fn open(&self, session_id: i32, channel_id: i32, handler: Handler) -> Result<TunnelHandle> {
        let tunnel = self
            .manager
            .create(session_id, channel_id, TunnelState::Closed)?;
        tunnel.lock.lock().unwrap().handler = Some(handler);

        if ops::send_handshake_req(&tunnel, &*self.manager.carrier).is_err() {
            self.manager.destroy(&tunnel, false);
            return Err(RdtError::Generic("handshake_req rejected by state table".into()));
        }

        let deadline = Instant::now() + self.manager.config.tunnel_open_timeout();
        let mut guard = tunnel.lock.lock().unwrap();
        loop {
            match guard.state {
                TunnelState::Ready => break,
                TunnelState::Closed => {
                    drop(guard);
                    return Err(RdtError::Generic("tunnel closed during handshake".into()));
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                drop(guard);
                self.manager.destroy(&tunnel, true);
                return Err(RdtError::Generic("handshake timed out".into()));
            }
            let (g, _) = tunnel
                .handshake_cond
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
        }
        drop(guard);
        Ok(tunnel.handle)
    }

    /// Graceful shutdown of one tunnel: sends SHUTDOWN and tears the tunnel
    /// down.
    pub fn close(&self, handle: TunnelHandle) -> Result<()> {
        let tunnel = self.manager.get(handle.0).ok_or(RdtError::BadRdtTunnel)?;
        self.manager.destroy(&tunnel, true);
        Ok(())
    }

    /// Enqueue outbound data. The tunnel must be in READY; any other state
    /// is reported as `BadRdtTunnel`.
    pub fn write(&self, handle: TunnelHandle, data: &[u8]) -> Result<()> {
        let tunnel = self.manager.get(handle.0).ok_or(RdtError::BadRdtTunnel)?;
        ops::send_data(&tunnel, data).map_err(|_| RdtError::BadRdtTunnel)
    }

    /// Per-tunnel counters.
    pub fn get_info(&self, handle: TunnelHandle) -> Result<TunnelInfo> {
        self.manager.info(handle.0).ok_or(RdtError::BadRdtTunnel)
    }

    /// Tear down every live tunnel. Also runs implicitly on `Drop`.
    pub fn shutdown(&self) {
        self.manager.destroy_all();
    }
}

impl Drop for RdtContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::loopback::LoopbackCarrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.tx_backpressure_factor_us = 0;
        config
    }

    #[test]
    fn open_succeeds_when_peer_accepts() {
        // Build directly rather than through `wire_up`, since that helper's
        // `try_unwrap` would panic here (the dispatch closures hold the only
        // other references, and we need both call sites to work for the
        // duration of the test).
        let carrier_a = LoopbackCarrier::new();
        let carrier_b = LoopbackCarrier::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);

        let b = Arc::new(RdtContext::new(
            logger(),
            test_config(),
            carrier_b.clone(),
            Box::new(move |_s, _c, _h| {
                count2.fetch_add(1, Ordering::SeqCst);
                Some(Handler {
                    on_data: Box::new(|_| {}),
                    on_closed: Box::new(|_, _| {}),
                })
            }),
        ));
        let a = Arc::new(RdtContext::new(
            logger(),
            test_config(),
            carrier_a.clone(),
            Box::new(|_, _, _| None),
        ));

        let b2 = Arc::clone(&b);
        let a2 = Arc::clone(&a);
        carrier_a.set_peer(move |s, c, buf| b2.dispatch(s, c, buf));
        carrier_b.set_peer(move |s, c, buf| a2.dispatch(s, c, buf));

        let handle = a
            .open(
                1,
                1,
                Handler {
                    on_data: Box::new(|_| {}),
                    on_closed: Box::new(|_, _| {}),
                },
            )
            .expect("handshake should complete");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        a.write(handle, b"hello").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        a.close(handle).unwrap();
    }

    #[test]
    fn open_times_out_when_nothing_answers() {
        // No peer registered: every HANDSHAKE_REQ vanishes into the carrier,
        // so the opener must give up after its retry ladder is exhausted.
        let carrier_a = LoopbackCarrier::new();
        let mut cfg = Config::default();
        cfg.handshake_timeout = std::time::Duration::from_millis(10);
        cfg.handshake_retries = 2;
        let a = RdtContext::new(logger(), cfg, carrier_a, Box::new(|_, _, _| None));

        let result = a.open(
            1,
            1,
            Handler {
                on_data: Box::new(|_| {}),
                on_closed: Box::new(|_, _| {}),
            },
        );
        assert!(result.is_err());
    }
}
