//! Tunnel manager: lifecycle of tunnels, TEID allocation, the
//! per-(session, channel) cap, bulk teardown, and the timer callback. Also
//! hosts the receiver dispatch, since both need the same registry lock
//! order (manager -> tunnel -> queue).

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use fnv::{FnvHashMap, FnvHashSet};
use slog::Logger;

use crate::carrier::Carrier;
use crate::codec::Message;
use crate::config::Config;
use crate::forward;
use crate::ops;
use crate::rxq::RxPacket;
use crate::state::TunnelState;
use crate::tunnel::{Handler, TimerKind, Tunnel, TunnelHandle};

/// Invoked when an inbound handshake completes on the accepting side;
/// returns the handlers the application wants attached, or `None` to refuse
/// the tunnel.
pub type OpenedCallback = Box<dyn Fn(i32, i32, TunnelHandle) -> Option<Handler> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelInfo {
    pub session_id: i32,
    pub channel_id: i32,
    pub bytes_of_sent: u64,
    pub bytes_of_received: u64,
}

struct Registry {
    tunnels: FnvHashMap<u16, Arc<Tunnel>>,
    channels: FnvHashMap<(i32, i32), FnvHashSet<u16>>,
    next_teid: u16,
}

pub struct TunnelManager {
    pub(crate) log: Logger,
    pub(crate) config: Arc<Config>,
    pub(crate) carrier: Arc<dyn Carrier>,
    on_rdt_opened: OpenedCallback,
    forward_hook: Mutex<Option<forward::ForwardHook>>,
    registry: Mutex<Registry>,
}

impl TunnelManager {
    pub fn new(log: Logger, config: Arc<Config>, carrier: Arc<dyn Carrier>, on_rdt_opened: OpenedCallback) -> Arc<Self> {
        Arc::new(TunnelManager {
            log,
            config,
            carrier,
            on_rdt_opened,
            forward_hook: Mutex::new(None),
            registry: Mutex::new(Registry {
                tunnels: FnvHashMap::default(),
                channels: FnvHashMap::default(),
                next_teid: 1,
            }),
        })
    }

    pub fn set_forward_hook(&self, hook: Option<forward::ForwardHook>) {
        *self.forward_hook.lock().unwrap() = hook;
    }

    pub fn get(&self, teid: u16) -> Option<Arc<Tunnel>> {
        self.registry.lock().unwrap().tunnels.get(&teid).cloned()
    }

    fn find_by_peer(&self, session_id: i32, channel_id: i32, peer_teid: u16) -> Option<Arc<Tunnel>> {
        let reg = self.registry.lock().unwrap();
        let teids = reg.channels.get(&(session_id, channel_id))?;
        teids.iter().find_map(|teid| {
            let t = reg.tunnels.get(teid)?;
            let inner = t.lock.lock().unwrap();
            if inner.peer_teid == peer_teid {
                Some(Arc::clone(t))
            } else {
                None
            }
        })
    }

    fn allocate_teid(&self, reg: &mut Registry) -> crate::error::Result<u16> {
        if reg.next_teid == 0 {
            return Err(crate::error::RdtError::Generic(
                "TEID space exhausted".into(),
            ));
        }
        let teid = reg.next_teid;
        reg.next_teid = reg.next_teid.wrapping_add(1);
        Ok(teid)
    }

    /// Create and register a tunnel, and start its timer thread (the
    /// handshake retry ladder needs the timer running before READY). The
    /// tx/rx dispatcher threads are started separately, by
    /// `start_dispatchers`, once the tunnel reaches READY.
    pub fn create(
        self: &Arc<Self>,
        session_id: i32,
        channel_id: i32,
        initial_state: TunnelState,
    ) -> crate::error::Result<Arc<Tunnel>> {
        let mut reg = self.registry.lock().unwrap();
        let key = (session_id, channel_id);
        let existing = reg.channels.get(&key).map(|s| s.len()).unwrap_or(0);
        if existing >= self.config.max_tunnels_per_channel {
            return Err(crate::error::RdtError::ExceedLimit);
        }
        let teid = self.allocate_teid(&mut reg)?;
        let first_on_channel = !reg.channels.contains_key(&key) || reg.channels[&key].is_empty();

        let log = self.log.new(o!("teid" => teid));
        let tunnel = Tunnel::new(log, Arc::clone(&self.config), teid, session_id, channel_id, initial_state);

        reg.tunnels.insert(teid, Arc::clone(&tunnel));
        reg.channels.entry(key).or_default().insert(teid);
        drop(reg);

        if first_on_channel {
            self.carrier.session_set_hook(session_id, channel_id, true);
        }

        let this = Arc::clone(self);
        tunnel.start_timer_thread(move |t| this.handle_timer(t));
        Ok(tunnel)
    }

    /// Unregister and tear a tunnel down: optionally send SHUTDOWN, invoke
    /// `onClosed` exactly once, stop and join both dispatcher threads and
    /// the timer thread.
    pub fn destroy(&self, tunnel: &Arc<Tunnel>, send_shutdown: bool) {
        let (session_id, channel_id, teid) = {
            let inner = tunnel.lock.lock().unwrap();
            (inner.session_id, inner.channel_id, inner.local_teid)
        };
        let key = (session_id, channel_id);
        // `tunnels.remove` is the single point of truth for "am I the first
        // caller to destroy this tunnel" — concurrent destroy attempts (e.g.
        // application `close` racing the timer's retry-exhausted teardown)
        // must run the one-shot side effects below exactly once.
        let (removed, last_on_channel) = {
            let mut reg = self.registry.lock().unwrap();
            let removed = reg.tunnels.remove(&teid).is_some();
            let empty = if let Some(set) = reg.channels.get_mut(&key) {
                set.remove(&teid);
                set.is_empty()
            } else {
                true
            };
            if empty {
                reg.channels.remove(&key);
            }
            (removed, empty)
        };
        if !removed {
            return;
        }

        if last_on_channel {
            self.carrier.session_set_hook(session_id, channel_id, false);
        }

        // Send SHUTDOWN while the state table still reflects whatever
        // pre-Closed state the tunnel was in; `ops::shutdown` rejects it
        // once we flip to Closed below.
        if send_shutdown {
            let _ = ops::shutdown(tunnel, &*self.carrier);
        }

        let handler = {
            let mut inner = tunnel.lock.lock().unwrap();
            inner.state = TunnelState::Closed;
            inner.handler.take()
        };
        tunnel.handshake_cond.notify_all();
        if let Some(h) = handler {
            (h.on_closed)(tunnel.handle, 0);
        }

        tunnel.shutdown_threads();
    }

    pub fn destroy_all(&self) {
        // Snapshot only; `destroy` below does the actual registry removal
        // and one-shot teardown per tunnel.
        let all: Vec<Arc<Tunnel>> = {
            let reg = self.registry.lock().unwrap();
            reg.tunnels.values().cloned().collect()
        };
        for t in all {
            self.destroy(&t, true);
        }
    }

    /// Timer callback, invoked by a tunnel's own timer thread on expiry.
    pub fn handle_timer(self: &Arc<Self>, tunnel: &Arc<Tunnel>) {
        let kind = tunnel.lock.lock().unwrap().timer_kind;
        match kind {
            TimerKind::HandshakeReq => {
                let exceeded = {
                    let mut inner = tunnel.lock.lock().unwrap();
                    inner.timeout_counter += 1;
                    inner.timeout_counter >= self.config.handshake_retries
                };
                if exceeded {
                    warn!(tunnel.log, "handshake request retries exhausted");
                    self.destroy(tunnel, true);
                } else {
                    let _ = ops::send_handshake_req(tunnel, &*self.carrier);
                }
            }
            TimerKind::HandshakeResp => {
                let exceeded = {
                    let mut inner = tunnel.lock.lock().unwrap();
                    inner.timeout_counter += 1;
                    inner.timeout_counter >= self.config.handshake_retries
                };
                if exceeded {
                    warn!(tunnel.log, "handshake response retries exhausted");
                    self.destroy(tunnel, true);
                } else {
                    let _ = ops::send_handshake_resp(tunnel, &*self.carrier);
                }
            }
            TimerKind::DataAck => {
                let exceeded = {
                    let mut inner = tunnel.lock.lock().unwrap();
                    inner.timeout_counter += 1;
                    inner.timeout_counter >= self.config.data_ack_retries
                };
                if exceeded {
                    warn!(tunnel.log, "data-ack retries exhausted");
                    self.destroy(tunnel, true);
                    return;
                }
                let outcome = tunnel.txq.lock().unwrap().trigger_resend();
                use crate::txq::AckOutcome;
                match outcome {
                    AckOutcome::ResendTriggered => {
                        tunnel.tx_cond.notify_all();
                        tunnel.arm_timer(self.config.data_ack_timeout, TimerKind::DataAck);
                    }
                    _ => {
                        let mut inner = tunnel.lock.lock().unwrap();
                        inner.data_sending = false;
                        inner.timeout_counter = 0;
                        drop(inner);
                        tunnel.arm_timer(self.config.keepalive_timeout, TimerKind::Keepalive);
                    }
                }
            }
            TimerKind::Keepalive => {
                let exceeded = {
                    let mut inner = tunnel.lock.lock().unwrap();
                    inner.timeout_counter += 1;
                    inner.timeout_counter >= self.config.keepalive_retries
                };
                if exceeded {
                    warn!(tunnel.log, "keepalive retries exhausted");
                    self.destroy(tunnel, true);
                } else {
                    let _ = ops::keepalive(tunnel, &*self.carrier);
                    tunnel.arm_timer(self.config.keepalive_timeout, TimerKind::Keepalive);
                }
            }
        }
    }

    /// Receiver dispatch entry point: the carrier's registered inbound
    /// callback funnels every datagram for this (session, channel)
    /// through here.
    pub fn dispatch(self: &Arc<Self>, session_id: i32, channel_id: i32, buf: Bytes) {
        let msg = match Message::decode(buf) {
            Ok(m) => m,
            Err(e) => {
                warn!(self.log, "dropping undecodable datagram"; "reason" => %e);
                return;
            }
        };

        match msg {
            Message::HandshakeReq {
                version,
                lteid,
                seq,
                mtu,
                windowsz,
            } => self.on_handshake_req(session_id, channel_id, version, lteid, seq, mtu, windowsz),
            Message::HandshakeResp {
                rteid,
                version,
                lteid,
                seq,
                seq_ack,
                mtu: _,
                windowsz,
            } => self.on_handshake_resp(rteid, version, lteid, seq, seq_ack, windowsz),
            Message::HandshakeFin {
                rteid,
                version,
                seq,
                seq_ack,
            } => self.on_handshake_fin(rteid, version, seq, seq_ack),
            Message::DataAck {
                rteid,
                seq_ack,
                windowsz,
            } => self.on_data_ack(rteid, seq_ack, windowsz),
            Message::Keepalive { rteid } => self.on_keepalive(rteid),
            Message::Shutdown { rteid } => self.on_shutdown(rteid),
            Message::Data { rteid, seq, payload } => self.on_data(rteid, seq, payload),
        }
    }

    fn version_ok(&self, version: u16) -> bool {
        (version & 0x3f) as u16 == self.config.version
    }

    fn on_handshake_req(
        self: &Arc<Self>,
        session_id: i32,
        channel_id: i32,
        version: u16,
        lteid: u16,
        seq: u32,
        _mtu: u32,
        windowsz: u32,
    ) {
        if !self.version_ok(version) {
            error!(self.log, "rejecting handshake_req with unsupported version"; "version" => version);
            return;
        }
        if self.find_by_peer(session_id, channel_id, lteid).is_some() {
            debug!(self.log, "duplicate handshake_req, dropping"; "peer_teid" => lteid);
            return;
        }
        let tunnel = match self.create(session_id, channel_id, TunnelState::Closed) {
            Ok(t) => t,
            Err(e) => {
                warn!(self.log, "rejecting handshake_req"; "reason" => %e);
                return;
            }
        };
        {
            let mut inner = tunnel.lock.lock().unwrap();
            inner.peer_teid = lteid;
            inner.ctrl_ack_num = seq + 1;
            inner.peer_window_sz = windowsz;
        }
        if ops::send_handshake_resp(&tunnel, &*self.carrier).is_err() {
            error!(self.log, "handshake_resp rejected by state table");
        }
    }

    fn on_handshake_resp(
        self: &Arc<Self>,
        rteid: u16,
        version: u16,
        lteid: u16,
        _seq: u32,
        seq_ack: u32,
        windowsz: u32,
    ) {
        if !self.version_ok(version) {
            error!(self.log, "rejecting handshake_resp with unsupported version");
            return;
        }
        let tunnel = match self.get(rteid) {
            Some(t) => t,
            None => {
                warn!(self.log, "handshake_resp for unknown teid"; "teid" => rteid);
                return;
            }
        };
        {
            let mut inner = tunnel.lock.lock().unwrap();
            if inner.state != TunnelState::HandshakeReqSent {
                debug!(self.log, "handshake_resp in wrong state, dropping");
                return;
            }
            inner.peer_teid = lteid;
            inner.peer_window_sz = windowsz;
            inner.ctrl_ack_num = seq_ack;
            inner.seq_num += 1;
            inner.timeout_counter = 0;
        }
        if ops::send_handshake_fin(&tunnel, &*self.carrier).is_ok() {
            self.start_dispatchers(&tunnel);
        }
    }

    fn on_handshake_fin(self: &Arc<Self>, rteid: u16, version: u16, _seq: u32, _seq_ack: u32) {
        if !self.version_ok(version) {
            error!(self.log, "rejecting handshake_fin with unsupported version");
            return;
        }
        let tunnel = match self.get(rteid) {
            Some(t) => t,
            None => {
                warn!(self.log, "handshake_fin for unknown teid"; "teid" => rteid);
                return;
            }
        };
        {
            let mut inner = tunnel.lock.lock().unwrap();
            if inner.state != TunnelState::HandshakeRespSent {
                debug!(self.log, "handshake_fin in wrong state, dropping");
                return;
            }
            inner.seq_num += 1;
            inner.timeout_counter = 0;
        }
        if ops::handshake_delayed_finish(&tunnel).is_err() {
            return;
        }
        let (session_id, channel_id) = {
            let inner = tunnel.lock.lock().unwrap();
            (inner.session_id, inner.channel_id)
        };
        match (self.on_rdt_opened)(session_id, channel_id, tunnel.handle) {
            Some(handler) => {
                tunnel.lock.lock().unwrap().handler = Some(handler);
                self.start_dispatchers(&tunnel);
            }
            None => {
                warn!(self.log, "application refused inbound tunnel"; "teid" => tunnel.handle.0);
                self.destroy(&tunnel, true);
            }
        }
    }

    fn on_data_ack(self: &Arc<Self>, rteid: u16, seq_ack: u32, windowsz: u32) {
        let tunnel = match self.ready_tunnel(rteid) {
            Some(t) => t,
            None => return,
        };
        tunnel.lock.lock().unwrap().peer_window_sz = windowsz;
        let outcome = tunnel.txq.lock().unwrap().update_ack(seq_ack);
        use crate::txq::AckOutcome;
        match outcome {
            AckOutcome::ResendTriggered => {
                tunnel.tx_cond.notify_all();
            }
            AckOutcome::Advanced => {
                if tunnel.txq.lock().unwrap().is_empty() {
                    tunnel.lock.lock().unwrap().data_sending = false;
                }
            }
            _ => {}
        }
        self.reset_and_rearm(&tunnel);
    }

    fn on_keepalive(self: &Arc<Self>, rteid: u16) {
        if let Some(tunnel) = self.ready_tunnel(rteid) {
            self.reset_and_rearm(&tunnel);
        }
    }

    fn on_shutdown(self: &Arc<Self>, rteid: u16) {
        let tunnel = match self.get(rteid) {
            Some(t) => t,
            None => return,
        };
        if ops::shutdown_recv(&tunnel).is_ok() {
            self.destroy(&tunnel, false);
        }
    }

    fn on_data(self: &Arc<Self>, rteid: u16, seq: u32, payload: Bytes) {
        let tunnel = match self.ready_tunnel(rteid) {
            Some(t) => t,
            None => return,
        };
        self.reset_and_rearm(&tunnel);

        tunnel.lock.lock().unwrap().rx_bytes += payload.len() as u64;
        let ack = tunnel
            .rxq
            .lock()
            .unwrap()
            .arrange(RxPacket { seq, data: payload });
        tunnel.rx_cond.notify_all();
        let _ = ops::send_data_ack(&tunnel, &*self.carrier, ack);
    }

    fn ready_tunnel(&self, rteid: u16) -> Option<Arc<Tunnel>> {
        let tunnel = self.get(rteid)?;
        let ready = tunnel.lock.lock().unwrap().state == TunnelState::Ready;
        if ready {
            Some(tunnel)
        } else {
            warn!(self.log, "message for tunnel not in READY, dropping"; "teid" => rteid);
            None
        }
    }

    fn reset_and_rearm(&self, tunnel: &Arc<Tunnel>) {
        let data_sending = {
            let mut inner = tunnel.lock.lock().unwrap();
            inner.timeout_counter = 0;
            inner.data_sending
        };
        if data_sending {
            tunnel.arm_timer(self.config.data_ack_timeout, TimerKind::DataAck);
        } else {
            tunnel.arm_timer(self.config.keepalive_timeout, TimerKind::Keepalive);
        }
    }

    /// Start the tx/rx dispatcher threads for a tunnel that has just reached
    /// READY, wiring the tx dispatcher to the carrier and the rx dispatcher
    /// to the application (or port-forwarding) callback. The timer thread is
    /// already running, started by `create`.
    pub fn start_dispatchers(self: &Arc<Self>, tunnel: &Arc<Tunnel>) {
        let carrier = Arc::clone(&self.carrier);
        tunnel.start_tx_thread(move |t| {
            let mut inner = t.lock.lock().unwrap();
            let session_id = inner.session_id;
            let channel_id = inner.channel_id;
            let was_idle = !inner.data_sending;
            drop(inner);
            let mut sent_any = false;
            loop {
                let pkt = t.txq.lock().unwrap().fetch();
                match pkt {
                    Some(pkt) => {
                        carrier.session_write(session_id, channel_id, pkt.encoded);
                        sent_any = true;
                    }
                    None => break,
                }
            }
            if sent_any && was_idle {
                let mut inner = t.lock.lock().unwrap();
                inner.data_sending = true;
                drop(inner);
                t.arm_timer(t.config.data_ack_timeout, TimerKind::DataAck);
            }
        });

        let this = Arc::clone(self);
        tunnel.start_rx_thread(move |t| loop {
            let fetched = t.rxq.lock().unwrap().fetch();
            match fetched {
                Some((pkt, _more)) => this.deliver(t, &pkt.data),
                None => break,
            }
        });
    }

    fn deliver(&self, tunnel: &Arc<Tunnel>, data: &Bytes) {
        let hook_registered = self.forward_hook.lock().unwrap().is_some();
        let forward = {
            let mut inner = tunnel.lock.lock().unwrap();
            if !inner.fwd_data2upper && hook_registered && forward::is_latch_payload(data) {
                inner.fwd_data2upper = true;
            }
            inner.fwd_data2upper
        };

        if forward {
            if let Some(hook) = self.forward_hook.lock().unwrap().as_ref() {
                hook(tunnel.handle.0, data);
            }
            return;
        }
        let inner = tunnel.lock.lock().unwrap();
        if let Some(h) = inner.handler.as_ref() {
            (h.on_data)(data);
        }
    }

    pub fn info(&self, teid: u16) -> Option<TunnelInfo> {
        let tunnel = self.get(teid)?;
        let inner = tunnel.lock.lock().unwrap();
        Some(TunnelInfo {
            session_id: inner.session_id,
            channel_id: inner.channel_id,
            bytes_of_sent: inner.tx_bytes,
            bytes_of_received: inner.rx_bytes,
        })
    }
}
