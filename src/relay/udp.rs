use std::{net::SocketAddr, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{net::UdpSocket, sync::watch, time::timeout};
use tracing::{debug, warn};

use crate::relay::{
    accounting::Counters,
    errors::BindError,
    flow::{Flow, FlowProtocol},
    instance::{Deps, Instance},
    net::normalize_bind_addr,
};

/// Defines session liveness: a session with no target-side traffic for this
/// long is reaped. There is no separate client-side sweep.
const TARGET_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the listening socket blocks per read before re-checking for a
/// stop signal.
const LISTEN_READ_DEADLINE: Duration = Duration::from_secs(1);

struct Session {
    target: Arc<UdpSocket>,
    counters: Arc<Counters>,
}

pub async fn bind(addr: &str) -> Result<UdpSocket, BindError> {
    let addr = normalize_bind_addr(addr);
    UdpSocket::bind(addr.as_ref())
        .await
        .map_err(|source| BindError::Io {
            addr: addr.into_owned(),
            source,
        })
}

/// Receive loop for one rule's UDP side. A new client address dials a fresh
/// socket to the target and spawns a response reader for it; datagrams that
/// arrive for a client whose dial is still in flight sit in the kernel's
/// receive buffer (and may be dropped by it) since this loop does not read
/// again until the dial resolves — that is the documented drop behavior, not
/// a bug to work around.
pub async fn run(
    socket: Arc<UdpSocket>,
    instance: Arc<Instance>,
    deps: Deps,
    mut shutdown: watch::Receiver<bool>,
) {
    let sessions: Arc<DashMap<String, Session>> = Arc::new(DashMap::new());
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            recvd = timeout(LISTEN_READ_DEADLINE, socket.recv_from(&mut buf)) => {
                let (n, client_addr) = match recvd {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(err)) => {
                        warn!(%err, rule_id = %instance.rule.id, "udp recv error, continuing");
                        continue;
                    }
                    Err(_) => continue,
                };

                let key = client_addr.to_string();
                let (target_sock, flow_counters) = match sessions.get(&key) {
                    Some(session) => (session.target.clone(), session.counters.clone()),
                    None => {
                        match create_session(&key, client_addr, &socket, &instance, &deps, &sessions, shutdown.clone()).await {
                            Some(pair) => pair,
                            None => continue,
                        }
                    }
                };

                if let Err(err) = target_sock.send(&buf[..n]).await {
                    warn!(%err, rule_id = %instance.rule.id, "udp forward to target failed");
                    continue;
                }
                flow_counters.add_in(n as u64);
                instance.counters().add_in(n as u64);
            }
        }
    }
    debug!(rule_id = %instance.rule.id, "udp receive loop exited");
}

#[allow(clippy::too_many_arguments)]
async fn create_session(
    key: &str,
    client_addr: SocketAddr,
    listen_sock: &Arc<UdpSocket>,
    instance: &Arc<Instance>,
    deps: &Deps,
    sessions: &Arc<DashMap<String, Session>>,
    shutdown: watch::Receiver<bool>,
) -> Option<(Arc<UdpSocket>, Arc<Counters>)> {
    let target_addr = normalize_bind_addr(&instance.rule.dst).into_owned();
    let target_sock = match dial(&target_addr).await {
        Ok(sock) => Arc::new(sock),
        Err(err) => {
            warn!(%err, target = %target_addr, rule_id = %instance.rule.id, "udp dial failed");
            return None;
        }
    };

    let flow = instance
        .open_flow(client_addr.ip().to_string(), target_addr, FlowProtocol::Udp, deps)
        .await;
    let flow_counters = flow.counters.clone();

    sessions.insert(
        key.to_string(),
        Session {
            target: target_sock.clone(),
            counters: flow_counters.clone(),
        },
    );

    tokio::spawn(response_reader(
        listen_sock.clone(),
        target_sock.clone(),
        client_addr,
        flow,
        instance.clone(),
        deps.clone(),
        key.to_string(),
        sessions.clone(),
        shutdown,
    ));

    Some((target_sock, flow_counters))
}

async fn dial(target_addr: &str) -> std::io::Result<UdpSocket> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    sock.connect(target_addr).await?;
    Ok(sock)
}

#[allow(clippy::too_many_arguments)]
async fn response_reader(
    listen_sock: Arc<UdpSocket>,
    target_sock: Arc<UdpSocket>,
    client_addr: SocketAddr,
    flow: Arc<Flow>,
    instance: Arc<Instance>,
    deps: Deps,
    key: String,
    sessions: Arc<DashMap<String, Session>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(rule_id = %instance.rule.id, "udp session torn down by stop");
                    break;
                }
            }
            recvd = timeout(TARGET_READ_TIMEOUT, target_sock.recv(&mut buf)) => {
                match recvd {
                    Ok(Ok(n)) => {
                        if let Err(err) = listen_sock.send_to(&buf[..n], client_addr).await {
                            warn!(%err, rule_id = %instance.rule.id, "udp response write failed");
                            break;
                        }
                        flow.counters.add_out(n as u64);
                        instance.counters().add_out(n as u64);
                    }
                    Ok(Err(err)) => {
                        debug!(%err, rule_id = %instance.rule.id, "udp session target read error, reaping");
                        break;
                    }
                    Err(_) => {
                        debug!(rule_id = %instance.rule.id, "udp session idle, reaping");
                        break;
                    }
                }
            }
        }
    }
    sessions.remove(&key);
    instance.close_flow(flow, &deps);
}
