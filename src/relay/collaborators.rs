use async_trait::async_trait;

/// Resolves a client IP to a coarse location label (e.g. `"US"`, `"DE"`).
/// Called once at flow creation; best-effort. A lookup failure must never
/// block or fail a connection, so implementations should swallow their own
/// errors and return an empty string — the flow's `client_location` is then
/// left empty, same as if no lookup were configured at all.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, client_ip: &str) -> String;
}

/// A `GeoLookup` that never resolves anything, for deployments with no geo
/// database configured. Wired by default so the crate runs standalone.
pub struct NullGeoLookup;

#[async_trait]
impl GeoLookup for NullGeoLookup {
    async fn lookup(&self, _client_ip: &str) -> String {
        String::new()
    }
}

/// What happened to a client connection, for `AccessLogStore::save_access_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessAction {
    Connect,
    Disconnect,
}

/// Durable record of rule activity, independent of the in-memory telemetry
/// hub. The core never interprets a return value from these calls and never
/// waits on them inline — callers dispatch from a detached task so a slow or
/// failing store can't stall the data plane; failures are logged and
/// swallowed there, not surfaced back through this trait.
#[async_trait]
pub trait AccessLogStore: Send + Sync {
    async fn save_access_log(
        &self,
        rule_id: &str,
        client_ip: &str,
        action: AccessAction,
        bytes_in: u64,
        bytes_out: u64,
        duration_seconds: u64,
    );

    /// Deltas since the last call; the store aggregates these into its own
    /// hour bucket.
    async fn save_relay_stat(
        &self,
        rule_id: &str,
        delta_bytes_in: u64,
        delta_bytes_out: u64,
        delta_connections: i64,
    );
}

/// An `AccessLogStore` that discards everything, for deployments that only
/// want the live telemetry hub. Wired by default so the crate runs
/// standalone.
pub struct NullAccessLogStore;

#[async_trait]
impl AccessLogStore for NullAccessLogStore {
    async fn save_access_log(
        &self,
        _rule_id: &str,
        _client_ip: &str,
        _action: AccessAction,
        _bytes_in: u64,
        _bytes_out: u64,
        _duration_seconds: u64,
    ) {
    }

    async fn save_relay_stat(
        &self,
        _rule_id: &str,
        _delta_bytes_in: u64,
        _delta_bytes_out: u64,
        _delta_connections: i64,
    ) {
    }
}

/// The sampler's only outbound path to the telemetry fan-out hub. Kept as a
/// trait so the relay engine can be built and tested without the hub in the
/// loop; `Hub` is the sole real implementation.
pub trait Broadcaster: Send + Sync {
    fn broadcast_to_relay(&self, relay_id: &str, topic: &str, payload: serde_json::Value);
}
