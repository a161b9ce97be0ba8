//! The `Tunnel` type: per-tunnel state, locks, timer and dispatcher threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use slog::Logger;

use crate::config::Config;
use crate::rxq::RxQueue;
use crate::state::TunnelState;
use crate::txq::TxQueue;

/// Local Tunnel Endpoint Identifier; also the key used for O(1) lookup in
/// the manager's registry — the TEID doubles as the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelHandle(pub u16);

/// Application-supplied callbacks for a tunnel.
pub struct Handler {
    pub on_data: Box<dyn Fn(&[u8]) + Send + Sync>,
    pub on_closed: Box<dyn Fn(TunnelHandle, i32) + Send + Sync>,
}

/// What the timer should do when it next fires, set by whichever operation
/// last armed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    HandshakeReq,
    HandshakeResp,
    Keepalive,
    DataAck,
}

/// Mutable tunnel state guarded by `Tunnel::lock`. Exactly one timer kind is
/// meaningful at a time, tracked here as `timer_kind`.
pub struct Inner {
    pub state: TunnelState,
    pub session_id: i32,
    pub channel_id: i32,
    pub local_teid: u16,
    pub peer_teid: u16,
    pub seq_num: u32,
    pub ctrl_ack_num: u32,
    pub peer_window_sz: u32,
    pub timeout_counter: u32,
    pub data_sending: bool,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub fwd_data2upper: bool,
    pub handler: Option<Handler>,
    pub timer_kind: TimerKind,
}

/// Deadline shared between the owning tunnel and its timer thread. Bumping
/// `generation` on rearm wakes a thread sleeping on an older deadline.
struct TimerState {
    deadline: Instant,
    generation: u64,
    stop: bool,
    /// False until the first `arm_timer` call; an unarmed timer thread
    /// waits indefinitely instead of firing on its placeholder deadline.
    armed: bool,
}

pub struct Tunnel {
    pub handle: TunnelHandle,
    pub log: Logger,
    pub config: Arc<Config>,

    pub lock: Mutex<Inner>,
    pub handshake_cond: Condvar,

    pub txq: Mutex<TxQueue>,
    pub tx_cond: Condvar,
    pub tx_run: AtomicBool,

    pub rxq: Mutex<RxQueue>,
    pub rx_cond: Condvar,
    pub rx_run: AtomicBool,

    timer: Mutex<TimerState>,
    timer_cond: Condvar,

    threads: Mutex<Threads>,
}

#[derive(Default)]
struct Threads {
    tx: Option<JoinHandle<()>>,
    rx: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    timer_thread_id: Option<ThreadId>,
}

impl Tunnel {
    pub fn new(
        log: Logger,
        config: Arc<Config>,
        local_teid: u16,
        session_id: i32,
        channel_id: i32,
        initial_state: TunnelState,
    ) -> Arc<Tunnel> {
        let inner = Inner {
            state: initial_state,
            session_id,
            channel_id,
            local_teid,
            peer_teid: 0,
            seq_num: 0,
            ctrl_ack_num: 0,
            peer_window_sz: config.window_sz,
            timeout_counter: 0,
            data_sending: false,
            tx_bytes: 0,
            rx_bytes: 0,
            fwd_data2upper: false,
            handler: None,
            timer_kind: TimerKind::HandshakeReq,
        };

        Arc::new(Tunnel {
            handle: TunnelHandle(local_teid),
            log,
            txq: Mutex::new(TxQueue::new(
                config.max_txq_len,
                config.resend_trigger_count,
                0,
            )),
            rxq: Mutex::new(RxQueue::new(config.max_rxq_len, 1)),
            config,
            lock: Mutex::new(inner),
            handshake_cond: Condvar::new(),
            tx_cond: Condvar::new(),
            tx_run: AtomicBool::new(false),
            rx_cond: Condvar::new(),
            rx_run: AtomicBool::new(false),
            timer: Mutex::new(TimerState {
                deadline: Instant::now(),
                generation: 0,
                stop: false,
                armed: false,
            }),
            timer_cond: Condvar::new(),
            threads: Mutex::new(Threads::default()),
        })
    }

    /// (Re-)arm the timer to fire `delay` from now, and record what it
    /// should do on expiry. Wakes a sleeping timer thread so it adopts the
    /// new deadline immediately.
    pub fn arm_timer(&self, delay: Duration, kind: TimerKind) {
        self.lock.lock().unwrap().timer_kind = kind;
        let mut t = self.timer.lock().unwrap();
        t.deadline = Instant::now() + delay;
        t.generation += 1;
        t.armed = true;
        self.timer_cond.notify_all();
    }

    /// Start the timer thread, invoking `on_fire` each time the deadline is
    /// reached. `on_fire` is responsible for re-arming (via `arm_timer`) or
    /// leaving the timer stopped if the tunnel is being destroyed.
    pub fn start_timer_thread(self: &Arc<Self>, on_fire: impl Fn(&Arc<Tunnel>) + Send + 'static) {
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || loop {
            let mut guard = this.timer.lock().unwrap();
            if guard.stop {
                return;
            }
            let seen_generation = guard.generation;
            if !guard.armed {
                // No deadline set yet; wait indefinitely rather than firing
                // on the placeholder deadline.
                guard = this.timer_cond.wait(guard).unwrap();
                if guard.stop {
                    return;
                }
                continue;
            }
            let now = Instant::now();
            if guard.deadline > now {
                let wait = guard.deadline - now;
                let (g, _) = this.timer_cond.wait_timeout(guard, wait).unwrap();
                guard = g;
                if guard.stop {
                    return;
                }
                if guard.generation != seen_generation || guard.deadline > Instant::now() {
                    // Rearmed (or woken spuriously) before expiry; reloop.
                    continue;
                }
            }
            drop(guard);
            on_fire(&this);
        });
        let mut threads = self.threads.lock().unwrap();
        threads.timer_thread_id = Some(handle.thread().id());
        threads.timer = Some(handle);
    }

    pub fn start_tx_thread(self: &Arc<Self>, on_wake: impl Fn(&Arc<Tunnel>) + Send + 'static) {
        self.tx_run.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while this.tx_run.load(Ordering::SeqCst) {
                on_wake(&this);
                let guard = this.txq.lock().unwrap();
                if !this.tx_run.load(Ordering::SeqCst) {
                    return;
                }
                let _ = this
                    .tx_cond
                    .wait_timeout(guard, Duration::from_millis(200))
                    .unwrap();
            }
        });
        self.threads.lock().unwrap().tx = Some(handle);
    }

    pub fn start_rx_thread(self: &Arc<Self>, on_wake: impl Fn(&Arc<Tunnel>) + Send + 'static) {
        self.rx_run.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while this.rx_run.load(Ordering::SeqCst) {
                on_wake(&this);
                let guard = this.rxq.lock().unwrap();
                if !this.rx_run.load(Ordering::SeqCst) {
                    return;
                }
                let _ = this
                    .rx_cond
                    .wait_timeout(guard, Duration::from_millis(200))
                    .unwrap();
            }
        });
        self.threads.lock().unwrap().rx = Some(handle);
    }

    /// Stop all three background threads and join them. Called exactly once
    /// from `TunnelManager::destroy` — possibly from the timer thread itself,
    /// when a retry ladder exhausts inside `handle_timer`. A thread can't
    /// join its own handle without deadlocking, so the timer handle is
    /// detached (dropped) rather than joined in that case.
    pub fn shutdown_threads(&self) {
        self.tx_run.store(false, Ordering::SeqCst);
        self.rx_run.store(false, Ordering::SeqCst);
        self.tx_cond.notify_all();
        self.rx_cond.notify_all();
        {
            let mut t = self.timer.lock().unwrap();
            t.stop = true;
            t.generation += 1;
        }
        self.timer_cond.notify_all();

        let mut threads = self.threads.lock().unwrap();
        if let Some(h) = threads.tx.take() {
            let _ = h.join();
        }
        if let Some(h) = threads.rx.take() {
            let _ = h.join();
        }
        if let Some(h) = threads.timer.take() {
            if threads.timer_thread_id == Some(std::thread::current().id()) {
                drop(h);
            } else {
                let _ = h.join();
            }
        }
    }
}
