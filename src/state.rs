//! State machine: a state-indexed transition table, rather than per-state
//! function-pointer dispatch, with unsupported operations rejected
//! explicitly instead of silently dropped. `permitted` is that table;
//! callers that want the old "silently ignored" receive-path behavior treat
//! `Err(NotPermitted)` as "log and drop" themselves.

use std::fmt;

use failure::Fail;

/// Lifecycle state of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    HandshakeReqSent,
    HandshakeRespSent,
    Ready,
    Closed,
}

/// An operation a tunnel may attempt to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    SendHandshakeReq,
    SendHandshakeResp,
    SendHandshakeFin,
    DeliverOpened,
    SendData,
    SendDataAck,
    SendKeepalive,
    SendShutdown,
    RecvShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Fail)]
#[fail(display = "operation {:?} not permitted in state {:?}", op, state)]
pub struct NotPermitted {
    pub op: Op,
    pub state: TunnelState,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The permitted-operations table.
///
/// `CLOSED` does not appear as a row here: a `Closed` tunnel has already been
/// torn down by the manager and operations are rejected by `BadRdtTunnel`
/// before reaching the state table at all (so `CLOSED` only acts as the
/// *initial* and *terminal* state, never as a live row).
pub fn permitted(state: TunnelState, op: Op) -> Result<(), NotPermitted> {
    use Op::*;
    use TunnelState::*;

    let ok = match (state, op) {
        (HandshakeReqSent, SendHandshakeReq) => true, // retry
        (HandshakeReqSent, SendShutdown) => true,
        (HandshakeReqSent, RecvShutdown) => true,
        (HandshakeReqSent, SendHandshakeFin) => true, // on RESP received

        (HandshakeRespSent, SendHandshakeResp) => true, // retry
        (HandshakeRespSent, SendShutdown) => true,
        (HandshakeRespSent, RecvShutdown) => true,
        (HandshakeRespSent, DeliverOpened) => true, // on FIN received

        (Ready, SendData) => true,
        (Ready, SendDataAck) => true,
        (Ready, SendKeepalive) => true,
        (Ready, SendShutdown) => true,
        (Ready, RecvShutdown) => true,

        // Active open / answering an inbound REQ both start from CLOSED;
        // the manager creates the tunnel in that instant and these two
        // operations are the ones that may apply to it.
        (Closed, SendHandshakeReq) => true,
        (Closed, SendHandshakeResp) => true,

        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(NotPermitted { op, state })
    }
}
