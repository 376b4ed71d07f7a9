use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use aga_common::{helpers::is_valid_identifier, SignalMessage};
use axum::http::StatusCode;

pub const MAX_SIGNAL_SDP_BYTES: usize = 32 * 1024;
pub const MAX_SIGNAL_CANDIDATE_BYTES: usize = 4096;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Why a socket upgrade was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooManyFromAddress,
    AtCapacity,
}

impl Rejection {
    pub fn status(self) -> StatusCode {
        match self {
            Rejection::TooManyFromAddress => StatusCode::TOO_MANY_REQUESTS,
            Rejection::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    per_ip: Mutex<HashMap<IpAddr, usize>>,
    active: AtomicUsize,
}

impl Counters {
    fn per_ip(&self) -> MutexGuard<'_, HashMap<IpAddr, usize>> {
        self.per_ip.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, ip: IpAddr) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        let mut counts = self.per_ip();
        if let Some(count) = counts.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&ip);
            }
        }
    }
}

/// Caps concurrent sockets globally and per client address.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    max_total: usize,
    max_per_ip: usize,
    counters: Arc<Counters>,
}

impl ConnectionLimiter {
    pub fn new(max_total: usize, max_per_ip: usize) -> Self {
        Self {
            max_total,
            max_per_ip,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::Relaxed)
    }

    /// Reserves a slot for `ip`; the slot is released when the permit drops.
    pub fn try_acquire(&self, ip: IpAddr) -> Result<ConnectionPermit, Rejection> {
        let mut counts = self.counters.per_ip();
        let count = counts.get(&ip).copied().unwrap_or(0);
        if count >= self.max_per_ip {
            return Err(Rejection::TooManyFromAddress);
        }
        if self.counters.active.load(Ordering::Relaxed) >= self.max_total {
            return Err(Rejection::AtCapacity);
        }
        counts.insert(ip, count + 1);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        Ok(ConnectionPermit {
            ip,
            counters: self.counters.clone(),
        })
    }
}

#[derive(Debug)]
pub struct ConnectionPermit {
    ip: IpAddr,
    counters: Arc<Counters>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.counters.release(self.ip);
    }
}

/// Fixed one-minute window message budget of a single socket.
#[derive(Debug)]
pub struct MessageBudget {
    max_per_minute: u32,
    window_start: Instant,
    count: u32,
}

impl MessageBudget {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            window_start: Instant::now(),
            count: 0,
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= RATE_WINDOW {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.max_per_minute
    }
}

/// Checks the routing fields and payload sizes of a negotiation message.
pub fn is_valid_forward(message: &SignalMessage) -> bool {
    let Some(peer) = message.peer() else {
        return false;
    };
    if !is_valid_identifier(peer) {
        return false;
    }
    match message {
        SignalMessage::Offer { sdp, .. } | SignalMessage::Answer { sdp, .. } => {
            sdp.sdp.len() <= MAX_SIGNAL_SDP_BYTES
        }
        SignalMessage::IceCandidate { candidate, .. } => {
            candidate.candidate.len() <= MAX_SIGNAL_CANDIDATE_BYTES
        }
        _ => false,
    }
}
