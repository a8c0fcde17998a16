use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::watch,
    time::timeout,
};
use tracing::{debug, warn};

use crate::relay::{
    accounting::{CountingWriter, Direction},
    errors::{BindError, CopyError, DialError},
    flow::FlowProtocol,
    instance::{Deps, Instance},
    net::normalize_bind_addr,
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn bind(addr: &str) -> Result<TcpListener, BindError> {
    let addr = normalize_bind_addr(addr);
    TcpListener::bind(addr.as_ref())
        .await
        .map_err(|source| BindError::Io {
            addr: addr.into_owned(),
            source,
        })
}

/// Accept loop for one rule's TCP side. Transient accept errors (e.g. fd
/// exhaustion) do not end the loop; only a stop signal or listener closure
/// does.
pub async fn run(
    listener: TcpListener,
    instance: Arc<Instance>,
    deps: Deps,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let instance = instance.clone();
                        let deps = deps.clone();
                        let shutdown_rx = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, instance, deps, shutdown_rx).await;
                        });
                    }
                    Err(err) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        warn!(%err, rule_id = %instance.rule.id, "tcp accept error, continuing");
                    }
                }
            }
        }
    }
    debug!(rule_id = %instance.rule.id, "tcp accept loop exited");
}

async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    instance: Arc<Instance>,
    deps: Deps,
    mut shutdown: watch::Receiver<bool>,
) {
    let target_addr = normalize_bind_addr(&instance.rule.dst).into_owned();
    let mut target = match timeout(DIAL_TIMEOUT, TcpStream::connect(&target_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            let err = DialError::Io { addr: target_addr.clone(), source };
            warn!(%err, rule_id = %instance.rule.id, "tcp dial failed");
            let _ = client.shutdown().await;
            return;
        }
        Err(_) => {
            let err = DialError::Timeout { addr: target_addr.clone() };
            warn!(%err, rule_id = %instance.rule.id, "tcp dial failed");
            let _ = client.shutdown().await;
            return;
        }
    };

    let flow = instance
        .open_flow(peer.ip().to_string(), target_addr, FlowProtocol::Tcp, &deps)
        .await;

    let flow_counters = flow.counters.clone();
    let rule_counters = instance.counters();

    {
        let (mut client_read, client_write) = client.split();
        let (mut target_read, target_write) = target.split();

        let mut counted_target_write = CountingWriter::new(
            target_write,
            Direction::In,
            flow_counters.clone(),
            rule_counters.clone(),
        );
        let mut counted_client_write =
            CountingWriter::new(client_write, Direction::Out, flow_counters, rule_counters);

        let inbound = async {
            let res = tokio::io::copy(&mut client_read, &mut counted_target_write).await;
            let _ = counted_target_write.shutdown().await;
            res
        };
        let outbound = async {
            let res = tokio::io::copy(&mut target_read, &mut counted_client_write).await;
            let _ = counted_client_write.shutdown().await;
            res
        };

        // Racing the copy against the stop signal is what makes an in-flight
        // (or merely idle) flow end when the instance is told to stop: once
        // `shutdown` fires, the join future above is dropped, releasing its
        // borrow of `client`/`target` so the explicit close below can run.
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(flow_id = %flow.id, rule_id = %instance.rule.id, "tcp flow cut short by stop");
            }
            (in_res, out_res) = async { tokio::join!(inbound, outbound) } => {
                if let Err(source) = in_res {
                    debug!(err = %CopyError::Io(source), flow_id = %flow.id, "tcp inbound copy ended with error");
                }
                if let Err(source) = out_res {
                    debug!(err = %CopyError::Io(source), flow_id = %flow.id, "tcp outbound copy ended with error");
                }
            }
        }
    }

    // Force-close both sockets so a copy still blocked on a syscall when the
    // stop signal fired actually releases its file descriptor.
    let _ = client.shutdown().await;
    let _ = target.shutdown().await;

    instance.close_flow(flow, &deps);
}
