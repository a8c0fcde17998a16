use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::relay::{
    errors::StartError,
    instance::{Deps, Instance},
    rule::{Rule, RuleStatus},
};

/// Owns every running instance, keyed by rule id. Enforces at most one
/// running instance per id and aggregates status across them.
#[derive(Default)]
pub struct Manager {
    instances: DashMap<String, Arc<Instance>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects with `AlreadyRunning` if an instance for `rule.id` already
    /// exists; binds and spawns a fresh one otherwise.
    pub async fn start(&self, rule: Rule, deps: Deps) -> Result<(), StartError> {
        if self.instances.contains_key(&rule.id) {
            return Err(StartError::AlreadyRunning(rule.id));
        }

        let rule_id = rule.id.clone();
        let instance = Instance::start(rule, deps).await?;
        self.instances.insert(rule_id.clone(), instance);
        info!(rule_id, "rule started");
        Ok(())
    }

    /// Idempotent: a non-running id is a no-op. Signals teardown and removes
    /// the instance from the map immediately; teardown itself finishes in
    /// the background (see `Instance::stop`).
    pub fn stop(&self, id: &str) {
        if let Some((_, instance)) = self.instances.remove(id) {
            instance.stop();
            info!(rule_id = id, "rule stopped");
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id);
        }
    }

    pub fn status(&self, id: &str) -> RuleStatus {
        self.instances
            .get(id)
            .map(|instance| instance.status())
            .unwrap_or_default()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{
        collaborators::{NullAccessLogStore, NullGeoLookup},
        hub::Hub,
        rule::RuleProtocol,
    };

    fn test_deps() -> Deps {
        Deps {
            geo: Arc::new(NullGeoLookup),
            store: Arc::new(NullAccessLogStore),
            broadcaster: Arc::new(Hub::new()),
        }
    }

    fn test_rule(id: &str, src: &str) -> Rule {
        Rule {
            id: id.to_string(),
            name: id.to_string(),
            src: src.to_string(),
            dst: "127.0.0.1:1".to_string(),
            protocol: RuleProtocol::Tcp,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn starting_an_already_running_rule_is_rejected() {
        let manager = Manager::new();
        let rule = test_rule("r1", "127.0.0.1:0");
        manager.start(rule.clone(), test_deps()).await.unwrap();

        let err = manager.start(rule.clone(), test_deps()).await.unwrap_err();
        assert!(matches!(err, StartError::AlreadyRunning(id) if id == "r1"));

        manager.stop("r1");
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_unknown_id() {
        let manager = Manager::new();
        manager.stop("never-started");
        assert!(!manager.is_running("never-started"));
    }

    #[tokio::test]
    async fn status_reports_zeroed_default_when_not_running() {
        let manager = Manager::new();
        let status = manager.status("missing");
        assert!(!status.running);
        assert_eq!(status.active_count, 0);
        assert_eq!(status.bytes_in, 0);
    }

    async fn spawn_tcp_echo() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// S1: a client connecting through a TCP rule gets its bytes echoed back
    /// by the target, and the rule's cumulative counters move.
    #[tokio::test]
    async fn tcp_echo_round_trip_through_rule() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let target_addr = spawn_tcp_echo().await;
        let manager = Manager::new();
        let rule = Rule {
            id: "echo".into(),
            name: "echo".into(),
            src: "127.0.0.1:0".into(),
            dst: target_addr.to_string(),
            protocol: RuleProtocol::Tcp,
            enabled: true,
        };

        // Bind on an ephemeral port up front so the test knows where to connect.
        let listen_probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listen_probe.local_addr().unwrap();
        drop(listen_probe);

        let mut rule_at_addr = rule.clone();
        rule_at_addr.src = listen_addr.to_string();
        manager.start(rule_at_addr, test_deps()).await.unwrap();

        let mut client = tokio::net::TcpStream::connect(listen_addr).await.unwrap();
        client.write_all(b"hello relaykit").await.unwrap();

        let mut buf = [0u8; 32];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello relaykit");

        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let status = manager.status("echo");
        assert!(status.running);
        assert!(status.bytes_in > 0);
        assert!(status.bytes_out > 0);

        manager.stop("echo");
    }

    /// S2: when the client half-closes (stops writing but keeps reading),
    /// the target still sees EOF, can send a final reply, and the client
    /// still receives it before the connection fully closes.
    #[tokio::test]
    async fn tcp_half_close_lets_target_reply_after_client_eof() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut received = Vec::new();
                let _ = stream.read_to_end(&mut received).await;
                let _ = stream.write_all(b"done").await;
            }
        });

        let manager = Manager::new();
        let listen_probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listen_probe.local_addr().unwrap();
        drop(listen_probe);

        let rule = Rule {
            id: "half-close".into(),
            name: "half-close".into(),
            src: listen_addr.to_string(),
            dst: target_addr.to_string(),
            protocol: RuleProtocol::Tcp,
            enabled: true,
        };
        manager.start(rule, test_deps()).await.unwrap();

        let mut client = tokio::net::TcpStream::connect(listen_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"done");

        manager.stop("half-close");
    }

    /// S5: if the TCP half of a `both`-protocol start succeeds but the UDP
    /// half fails, the TCP listener must not remain bound.
    #[tokio::test]
    async fn both_protocol_start_is_atomic_on_udp_bind_failure() {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        // Occupy the UDP side of that same port so the instance's UDP bind fails.
        let blocker = tokio::net::UdpSocket::bind(addr).await.unwrap();

        let manager = Manager::new();
        let rule = Rule {
            id: "both".into(),
            name: "both".into(),
            src: addr.to_string(),
            dst: "127.0.0.1:1".into(),
            protocol: RuleProtocol::Both,
            enabled: true,
        };

        let err = manager.start(rule, test_deps()).await.unwrap_err();
        assert!(matches!(err, StartError::Bind(_)));
        assert!(!manager.is_running("both"));

        drop(blocker);
        // The TCP listener from the failed attempt must have been closed;
        // otherwise this bind would fail with "address in use".
        let retry = tokio::net::TcpListener::bind(addr).await;
        assert!(retry.is_ok());
    }
}
