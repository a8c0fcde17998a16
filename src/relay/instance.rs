use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;

use crate::relay::{
    accounting::Counters,
    collaborators::{AccessAction, AccessLogStore, Broadcaster, GeoLookup},
    errors::StartError,
    flow::{Flow, FlowProtocol, FlowSnapshot},
    id::new_flow_id,
    net::normalize_bind_addr,
    rule::{Rule, RuleStatus},
    tcp, udp,
};

const HISTORY_CAPACITY: usize = 100;
const EMA_ALPHA: f64 = 0.3;

/// The three injectable collaborators a running instance needs, bundled so
/// they thread through `start`/accept-loop/session plumbing as one value.
#[derive(Clone)]
pub struct Deps {
    pub geo: Arc<dyn GeoLookup>,
    pub store: Arc<dyn AccessLogStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

#[derive(Default)]
struct RateEstimator {
    last_bytes_in: u64,
    last_bytes_out: u64,
    ema_in: f64,
    ema_out: f64,
}

impl RateEstimator {
    fn tick(&mut self, bytes_in: u64, bytes_out: u64) -> (u64, u64) {
        let rate_in = Self::update(&mut self.ema_in, &mut self.last_bytes_in, bytes_in);
        let rate_out = Self::update(&mut self.ema_out, &mut self.last_bytes_out, bytes_out);
        (rate_in, rate_out)
    }

    fn update(ema: &mut f64, last: &mut u64, current: u64) -> u64 {
        let delta = current.saturating_sub(*last) as f64;
        *last = current;
        if *ema == 0.0 && delta > 0.0 {
            *ema = delta;
        } else {
            *ema = EMA_ALPHA * delta + (1.0 - EMA_ALPHA) * *ema;
        }
        if *ema < 1.0 {
            *ema = 0.0;
        }
        ema.floor() as u64
    }
}

/// One running rule: its listeners' lifetime (tracked via the spawned task
/// handles), the active-flow set, the bounded history ring, the rule's
/// cumulative counters, and the rate estimator. Dropped only after `stop`.
pub struct Instance {
    pub rule: Rule,
    flows: DashMap<String, Arc<Flow>>,
    history: Mutex<VecDeque<FlowSnapshot>>,
    counters: Arc<Counters>,
    active_count: AtomicUsize,
    rate: Mutex<RateEstimator>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Instance {
    /// Binds every listener the rule's protocol selector needs before
    /// spawning anything. If `both` is selected and the UDP bind fails after
    /// the TCP listener already succeeded, the TCP listener is dropped (and
    /// so closed) before returning the error — no partially-started instance
    /// is ever registered.
    pub async fn start(rule: Rule, deps: Deps) -> Result<Arc<Instance>, StartError> {
        let src = normalize_bind_addr(&rule.src).into_owned();

        let tcp_listener = if rule.protocol.wants_tcp() {
            Some(tcp::bind(&src).await?)
        } else {
            None
        };

        let udp_socket = if rule.protocol.wants_udp() {
            match udp::bind(&src).await {
                Ok(sock) => Some(sock),
                Err(err) => {
                    drop(tcp_listener);
                    return Err(StartError::Bind(err));
                }
            }
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let instance = Arc::new(Instance {
            rule,
            flows: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            counters: Arc::new(Counters::new()),
            active_count: AtomicUsize::new(0),
            rate: Mutex::new(RateEstimator::default()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();

        if let Some(listener) = tcp_listener {
            let instance = instance.clone();
            let deps = deps.clone();
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                tcp::run(listener, instance, deps, rx).await;
            }));
        }

        if let Some(socket) = udp_socket {
            let instance = instance.clone();
            let deps = deps.clone();
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                udp::run(Arc::new(socket), instance, deps, rx).await;
            }));
        }

        {
            let instance = instance.clone();
            let deps = deps.clone();
            tasks.push(tokio::spawn(async move {
                instance.sampler_loop(deps, shutdown_rx).await;
            }));
        }

        *instance.tasks.lock().unwrap() = tasks;
        Ok(instance)
    }

    /// Signals every task spawned by `start` to exit at its next suspension
    /// point. Does not wait for them; the manager removes this instance from
    /// its map immediately so a subsequent start can proceed while teardown
    /// finishes in the background.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn status(&self) -> RuleStatus {
        RuleStatus {
            running: true,
            active_count: self.active_count.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in(),
            bytes_out: self.counters.bytes_out(),
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// Creates a Flow, registers it as active, and dispatches the
    /// access-log connect record from a detached task so a slow store can't
    /// stall the data path.
    pub async fn open_flow(
        self: &Arc<Self>,
        client_ip: String,
        target: String,
        protocol: FlowProtocol,
        deps: &Deps,
    ) -> Arc<Flow> {
        let location = deps.geo.lookup(&client_ip).await;
        let flow = Flow::new(new_flow_id(), client_ip.clone(), location, target, protocol);

        self.flows.insert(flow.id.clone(), flow.clone());
        self.active_count.fetch_add(1, Ordering::Relaxed);
        debug!(flow_id = %flow.id, rule_id = %self.rule.id, "flow open");
        metrics::gauge!("relaykit_active_connections", "rule_id" => self.rule.id.clone()).increment(1.0);

        let store = deps.store.clone();
        let rule_id = self.rule.id.clone();
        tokio::spawn(async move {
            store
                .save_access_log(&rule_id, &client_ip, AccessAction::Connect, 0, 0, 0)
                .await;
        });

        flow
    }

    /// Finalizes a flow, moves it into the history ring, and dispatches the
    /// disconnect access log and aggregated stat delta from a detached task.
    pub fn close_flow(self: &Arc<Self>, flow: Arc<Flow>, deps: &Deps) {
        flow.finish();
        self.flows.remove(&flow.id);
        self.active_count.fetch_sub(1, Ordering::Relaxed);
        debug!(flow_id = %flow.id, rule_id = %self.rule.id, "flow closed");
        metrics::gauge!("relaykit_active_connections", "rule_id" => self.rule.id.clone()).decrement(1.0);

        let snapshot = flow.snapshot();
        metrics::counter!("relaykit_bytes_total", "rule_id" => self.rule.id.clone(), "direction" => "in")
            .increment(snapshot.bytes_in);
        metrics::counter!("relaykit_bytes_total", "rule_id" => self.rule.id.clone(), "direction" => "out")
            .increment(snapshot.bytes_out);
        {
            let mut history = self.history.lock().unwrap();
            history.push_front(snapshot.clone());
            history.truncate(HISTORY_CAPACITY);
        }

        let store = deps.store.clone();
        let rule_id = self.rule.id.clone();
        tokio::spawn(async move {
            store
                .save_access_log(
                    &rule_id,
                    &snapshot.client_ip,
                    AccessAction::Disconnect,
                    snapshot.bytes_in,
                    snapshot.bytes_out,
                    snapshot.duration_seconds,
                )
                .await;
            store
                .save_relay_stat(&rule_id, snapshot.bytes_in, snapshot.bytes_out, 1)
                .await;
        });
    }

    async fn sampler_loop(self: Arc<Self>, deps: Deps, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.publish_sample(&deps);
                }
            }
        }
    }

    fn publish_sample(&self, deps: &Deps) {
        let mut connections: Vec<FlowSnapshot> =
            self.flows.iter().map(|entry| entry.value().snapshot()).collect();
        connections.extend(self.history.lock().unwrap().iter().cloned());

        deps.broadcaster.broadcast_to_relay(
            &self.rule.id,
            "relay.connections",
            serde_json::json!({
                "relay_id": self.rule.id,
                "connections": connections,
            }),
        );

        let bytes_in = self.counters.bytes_in();
        let bytes_out = self.counters.bytes_out();
        let (bytes_in_speed, bytes_out_speed) = self.rate.lock().unwrap().tick(bytes_in, bytes_out);

        deps.broadcaster.broadcast_to_relay(
            &self.rule.id,
            "relay.traffic",
            serde_json::json!({
                "relay_id": self.rule.id,
                "bytes_in": bytes_in,
                "bytes_out": bytes_out,
                "bytes_in_speed": bytes_in_speed,
                "bytes_out_speed": bytes_out_speed,
                "connections": self.active_count.load(Ordering::Relaxed),
            }),
        );
    }
}
