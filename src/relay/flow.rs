use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::relay::accounting::Counters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowProtocol {
    Tcp,
    Udp,
}

/// One client-to-target session: a TCP connection or a UDP client session.
///
/// Identity fields are set once at construction. Byte counters are mutated
/// only by the flow's own data-path via atomics; everything handed to an
/// observer is a `FlowSnapshot` taken under atomic reads, never a reference
/// into live state.
#[derive(Debug)]
pub struct Flow {
    pub id: String,
    pub client_ip: String,
    pub client_location: String,
    pub target: String,
    pub protocol: FlowProtocol,
    pub counters: Arc<Counters>,
    started_at: Instant,
    started_at_wall: SystemTime,
    active: AtomicBool,
    ended_at_wall: OnceLock<SystemTime>,
    frozen_duration_secs: AtomicU64,
}

impl Flow {
    pub fn new(
        id: String,
        client_ip: String,
        client_location: String,
        target: String,
        protocol: FlowProtocol,
    ) -> Arc<Flow> {
        Arc::new(Flow {
            id,
            client_ip,
            client_location,
            target,
            protocol,
            counters: Arc::new(Counters::new()),
            started_at: Instant::now(),
            started_at_wall: SystemTime::now(),
            active: AtomicBool::new(true),
            ended_at_wall: OnceLock::new(),
            frozen_duration_secs: AtomicU64::new(0),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the flow terminated and freezes its duration. Byte counters are
    /// already frozen in the sense that nothing writes to them after the
    /// data-path that owns this flow has finished; this only stops the
    /// duration from continuing to grow on future snapshots.
    pub fn finish(&self) {
        let elapsed = self.started_at.elapsed().as_secs();
        self.frozen_duration_secs.store(elapsed, Ordering::Relaxed);
        let _ = self.ended_at_wall.set(SystemTime::now());
        self.active.store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        let active = self.is_active();
        let duration = if active {
            self.started_at.elapsed().as_secs()
        } else {
            self.frozen_duration_secs.load(Ordering::Relaxed)
        };

        FlowSnapshot {
            id: self.id.clone(),
            client_ip: self.client_ip.clone(),
            client_location: self.client_location.clone(),
            target: self.target.clone(),
            protocol: self.protocol,
            bytes_in: self.counters.bytes_in(),
            bytes_out: self.counters.bytes_out(),
            started_at: iso8601(self.started_at_wall),
            ended_at: self.ended_at_wall.get().copied().map(iso8601),
            duration_seconds: duration,
            active,
        }
    }
}

fn iso8601(t: SystemTime) -> String {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(secs)).to_string()
}

/// A point-in-time copy of a flow's fields, safe to hand to observers and to
/// serialize into a `relay.connections` sample.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub id: String,
    pub client_ip: String,
    pub client_location: String,
    pub target: String,
    pub protocol: FlowProtocol,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_seconds: u64,
    pub active: bool,
}
