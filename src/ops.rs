//! Protocol operations.
//!
//! Each operation assumes the caller (receiver dispatch, or the public API)
//! has already updated whichever `Inner` fields the message needs (peer
//! TEID, `ctrl_ack_num`, `seq_num`); an operation's own job is to validate
//! it against the state table, encode the message, transmit it, advance
//! state, and re-arm the timer.

use std::sync::Arc;

use bytes::Bytes;

use crate::carrier::Carrier;
use crate::codec::Message;
use crate::state::{permitted, NotPermitted, Op, TunnelState};
use crate::tunnel::{Tunnel, TimerKind};
use crate::txq::TxPacket;

fn backoff(base: std::time::Duration, attempt: u32) -> std::time::Duration {
    base * (attempt + 1)
}

/// Active open: send HANDSHAKE_REQ, state -> HandshakeReqSent.
pub fn send_handshake_req(tunnel: &Arc<Tunnel>, carrier: &dyn Carrier) -> Result<(), NotPermitted> {
    let (msg, session_id, channel_id, delay);
    {
        let mut inner = tunnel.lock.lock().unwrap();
        permitted(inner.state, Op::SendHandshakeReq)?;
        msg = Message::HandshakeReq {
            version: tunnel.config.version,
            lteid: inner.local_teid,
            seq: inner.seq_num,
            mtu: tunnel.config.mtu,
            windowsz: tunnel.config.window_sz,
        };
        inner.state = TunnelState::HandshakeReqSent;
        session_id = inner.session_id;
        channel_id = inner.channel_id;
        delay = backoff(tunnel.config.handshake_timeout, inner.timeout_counter);
    }
    carrier.session_write(session_id, channel_id, msg.encode());
    tunnel.arm_timer(delay, TimerKind::HandshakeReq);
    Ok(())
}

/// Answer an inbound HANDSHAKE_REQ: send HANDSHAKE_RESP, state ->
/// HandshakeRespSent. Caller must have already set `peer_teid` and
/// `ctrl_ack_num` from the REQ.
pub fn send_handshake_resp(tunnel: &Arc<Tunnel>, carrier: &dyn Carrier) -> Result<(), NotPermitted> {
    let (msg, session_id, channel_id, delay);
    {
        let mut inner = tunnel.lock.lock().unwrap();
        permitted(inner.state, Op::SendHandshakeResp)?;
        msg = Message::HandshakeResp {
            rteid: inner.peer_teid,
            version: tunnel.config.version,
            lteid: inner.local_teid,
            seq: inner.seq_num,
            seq_ack: inner.ctrl_ack_num,
            mtu: tunnel.config.mtu,
            windowsz: tunnel.config.window_sz,
        };
        inner.state = TunnelState::HandshakeRespSent;
        session_id = inner.session_id;
        channel_id = inner.channel_id;
        delay = backoff(tunnel.config.handshake_timeout, inner.timeout_counter);
    }
    carrier.session_write(session_id, channel_id, msg.encode());
    tunnel.arm_timer(delay, TimerKind::HandshakeResp);
    Ok(())
}

/// A side: RESP received -> send HANDSHAKE_FIN, state -> Ready, signal the
/// opener's wait. Caller must have already recorded `peer_teid` and bumped
/// `seq_num` by 1.
pub fn send_handshake_fin(tunnel: &Arc<Tunnel>, carrier: &dyn Carrier) -> Result<(), NotPermitted> {
    let (msg, session_id, channel_id);
    {
        let mut inner = tunnel.lock.lock().unwrap();
        permitted(inner.state, Op::SendHandshakeFin)?;
        msg = Message::HandshakeFin {
            rteid: inner.peer_teid,
            version: tunnel.config.version,
            seq: inner.seq_num,
            seq_ack: inner.ctrl_ack_num,
        };
        inner.state = TunnelState::Ready;
        session_id = inner.session_id;
        channel_id = inner.channel_id;
    }
    carrier.session_write(session_id, channel_id, msg.encode());
    tunnel.handshake_cond.notify_all();
    tunnel.arm_timer(tunnel.config.keepalive_timeout, TimerKind::Keepalive);
    Ok(())
}

/// B side: FIN received -> state -> Ready. Does not send anything; the
/// caller (receiver dispatch) is responsible for invoking the upward
/// open callback and attaching the returned `Handler`, tearing the tunnel
/// down if none is returned.
pub fn handshake_delayed_finish(tunnel: &Arc<Tunnel>) -> Result<(), NotPermitted> {
    {
        let mut inner = tunnel.lock.lock().unwrap();
        permitted(inner.state, Op::DeliverOpened)?;
        inner.state = TunnelState::Ready;
    }
    tunnel.arm_timer(tunnel.config.keepalive_timeout, TimerKind::Keepalive);
    Ok(())
}

/// Enqueue outbound data. Assigns `seq`, advances `seq_num` by the payload
/// length, and pushes onto the TxQ; never blocks on the carrier itself, but
/// applies the queue-depth back-pressure placeholder before returning.
pub fn send_data(tunnel: &Arc<Tunnel>, data: &[u8]) -> Result<(), NotPermitted> {
    let (seq, rteid);
    {
        let mut inner = tunnel.lock.lock().unwrap();
        permitted(inner.state, Op::SendData)?;
        seq = inner.seq_num;
        inner.seq_num += data.len() as u32;
        inner.tx_bytes += data.len() as u64;
        rteid = inner.peer_teid;
    }
    let msg = Message::Data {
        rteid,
        seq,
        payload: Bytes::from(data.to_vec()),
    };
    let encoded = msg.encode();
    let queue_len = {
        let mut txq = tunnel.txq.lock().unwrap();
        txq.push(TxPacket {
            seq,
            len: data.len() as u32,
            encoded,
        });
        txq.len()
    };
    tunnel.tx_cond.notify_all();

    let factor = tunnel.config.tx_backpressure_factor_us;
    if factor > 0 {
        let micros = factor.saturating_mul((queue_len * queue_len) as u64);
        std::thread::sleep(std::time::Duration::from_micros(micros));
    }
    Ok(())
}

/// Send a cumulative ACK directly to the carrier (not queued).
pub fn send_data_ack(tunnel: &Arc<Tunnel>, carrier: &dyn Carrier, ack_num: u32) -> Result<(), NotPermitted> {
    let (rteid, session_id, channel_id, windowsz);
    {
        let inner = tunnel.lock.lock().unwrap();
        permitted(inner.state, Op::SendDataAck)?;
        rteid = inner.peer_teid;
        session_id = inner.session_id;
        channel_id = inner.channel_id;
        windowsz = tunnel.rxq.lock().unwrap().window_remaining();
    }
    let msg = Message::DataAck {
        rteid,
        seq_ack: ack_num,
        windowsz,
    };
    carrier.session_write(session_id, channel_id, msg.encode());
    Ok(())
}

pub fn keepalive(tunnel: &Arc<Tunnel>, carrier: &dyn Carrier) -> Result<(), NotPermitted> {
    let (rteid, session_id, channel_id);
    {
        let inner = tunnel.lock.lock().unwrap();
        permitted(inner.state, Op::SendKeepalive)?;
        rteid = inner.peer_teid;
        session_id = inner.session_id;
        channel_id = inner.channel_id;
    }
    let msg = Message::Keepalive { rteid };
    carrier.session_write(session_id, channel_id, msg.encode());
    Ok(())
}

pub fn shutdown(tunnel: &Arc<Tunnel>, carrier: &dyn Carrier) -> Result<(), NotPermitted> {
    let (rteid, session_id, channel_id, state);
    {
        let inner = tunnel.lock.lock().unwrap();
        state = inner.state;
        permitted(state, Op::SendShutdown)?;
        rteid = inner.peer_teid;
        session_id = inner.session_id;
        channel_id = inner.channel_id;
    }
    let msg = Message::Shutdown { rteid };
    carrier.session_write(session_id, channel_id, msg.encode());
    Ok(())
}

/// Inbound SHUTDOWN: state -> Closed, without re-sending shutdown. Teardown
/// itself (thread join, `onClosed`) is the manager's job.
pub fn shutdown_recv(tunnel: &Arc<Tunnel>) -> Result<(), NotPermitted> {
    let mut inner = tunnel.lock.lock().unwrap();
    permitted(inner.state, Op::RecvShutdown)?;
    inner.state = TunnelState::Closed;
    Ok(())
}
