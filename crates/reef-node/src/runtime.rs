//! The node composition root.

use std::sync::Arc;
use std::time::Duration;

use reef_cluster::Cluster;
use reef_compute::{JobError, JobRegistry, partition_by_home, run_local};
use reef_net::{Inbound, RemoteOp, Message, Wire};
use reef_store::BackendSet;
use reef_types::{BackendKind, Key, NodeAddr, RebootCause};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::dkv::{Dkv, DkvContext};
use crate::error::NodeError;
use crate::heartbeat::HeartbeatService;
use crate::remote::{OpOutput, RemoteCalls, decode_reply};

/// Tuning knobs for a node runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often to broadcast heartbeats.
    pub heartbeat_interval: Duration,
    /// Members silent longer than this are dropped from the view.
    pub staleness: Duration,
    /// Retransmission interval for unacknowledged requests.
    pub retry_interval: Duration,
    /// Backend tag for values created on this node.
    pub spill_backend: BackendKind,
    /// Values at least this large are spilled to the backend after
    /// publishing; `None` keeps everything resident.
    pub spill_threshold: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            staleness: Duration::from_secs(10),
            retry_interval: Duration::from_millis(250),
            spill_backend: BackendKind::Memory,
            spill_threshold: None,
        }
    }
}

/// One running Reef worker: cluster context, distributed KV, job
/// registry, dispatch pump and heartbeat service.
pub struct NodeRuntime {
    cluster: Arc<Cluster>,
    dkv: Arc<Dkv>,
    jobs: Arc<JobRegistry>,
    calls: Arc<RemoteCalls>,
    wire: Arc<dyn Wire>,
    dispatcher: Arc<Dispatcher>,
    pump: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl NodeRuntime {
    /// Start a runtime over a bound transport.
    pub fn start(
        wire: Arc<dyn Wire>,
        mut inbound: Inbound,
        backends: BackendSet,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let cluster = Cluster::new(wire.local_addr());
        let calls = RemoteCalls::new(wire.clone(), config.retry_interval);
        let dkv = Dkv::new(
            cluster.clone(),
            backends,
            calls.clone(),
            wire.clone(),
            config.spill_backend,
            config.spill_threshold,
            config.retry_interval,
        );
        let jobs = Arc::new(JobRegistry::new());
        let dispatcher = Dispatcher::new(
            cluster.clone(),
            dkv.clone(),
            jobs.clone(),
            calls.clone(),
            wire.clone(),
        );

        let pump = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                while let Some(envelope) = inbound.recv().await {
                    if let Err(e) = dispatcher.handle(envelope).await {
                        warn!("message handling failed: {e}");
                    }
                }
            })
        };

        let heartbeat = {
            let service = HeartbeatService::new(
                cluster.clone(),
                wire.clone(),
                dkv.clone(),
                config.heartbeat_interval,
                config.staleness,
            );
            tokio::spawn(service.run())
        };

        info!(local = %cluster.local().addr(), "node runtime started");
        Arc::new(Self {
            cluster,
            dkv,
            jobs,
            calls,
            wire,
            dispatcher,
            pump,
            heartbeat,
        })
    }

    /// The cluster context.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// The distributed key/value store.
    pub fn dkv(&self) -> &Arc<Dkv> {
        &self.dkv
    }

    /// The job registry. Register the same jobs on every node at boot.
    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// This node's listen address.
    pub fn local_addr(&self) -> NodeAddr {
        self.cluster.local().addr()
    }

    /// Intern seed addresses so the heartbeat loop starts courting them.
    pub fn add_seeds(&self, seeds: &[NodeAddr]) {
        for addr in seeds {
            if *addr != self.cluster.local().addr() {
                self.cluster.registry().intern(*addr);
            }
        }
    }

    /// Block until the view contains at least `count` members. Used at
    /// bootstrap to wait for the configured cluster size.
    pub async fn wait_for_members(&self, count: usize) {
        let mut rx = self.cluster.watch_view();
        loop {
            if self.cluster.view().len() >= count {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Observe fatal peer notices; fires with the cause when the
    /// process must terminate.
    pub fn fatal(&self) -> watch::Receiver<Option<RebootCause>> {
        self.dispatcher.fatal()
    }

    /// Run a registered job over a key list, fanning out across the
    /// cluster.
    ///
    /// Keys are partitioned by home node; spans homed elsewhere run
    /// remotely (idempotent task requests), the local span runs on the
    /// fork-join engine, and the partials merge with the job's
    /// associative reduce. An empty key list yields the job's identity.
    pub async fn submit_job(&self, name: &str, keys: &[Key]) -> Result<Vec<u8>, NodeError> {
        let job = self
            .jobs
            .get(name)
            .ok_or_else(|| JobError::Unknown(name.to_string()))?;
        let view = self.cluster.view();
        if view.is_empty() {
            return Err(NodeError::EmptyCluster);
        }

        let mut local_keys = Vec::new();
        let mut remote_tasks = Vec::new();
        for (node, span) in partition_by_home(keys, &view) {
            if Arc::ptr_eq(&node, self.cluster.local()) {
                local_keys = span;
                continue;
            }
            let calls = self.calls.clone();
            let name = name.to_string();
            remote_tasks.push(tokio::spawn(async move {
                let (task, reply) = calls
                    .call(&node, RemoteOp::RunJob { name, keys: span })
                    .await?;
                let output = decode_reply(&reply);
                calls.acknowledge(node.addr(), task).await;
                match output? {
                    OpOutput::Partial(partial) => Ok::<_, NodeError>(partial),
                    _ => Err(NodeError::UnexpectedReply),
                }
            }));
        }

        let ctx = Arc::new(DkvContext::new(self.dkv.clone()));
        let mut acc = run_local(job.clone(), ctx, local_keys).await?;
        for task in remote_tasks {
            let partial = task.await.expect("job fan-out task panicked")?;
            acc = job.merge(acc, partial)?;
        }
        Ok(acc)
    }

    /// Send a reboot notice to every known peer. `Reboot` tells them to
    /// void our task history; fatal causes take the whole cluster down.
    pub async fn broadcast_notice(&self, cause: RebootCause) {
        for node in self.cluster.registry().nodes() {
            if Arc::ptr_eq(&node, self.cluster.local()) {
                continue;
            }
            let _ = self
                .wire
                .send(node.addr(), Message::RebootNotice(cause))
                .await;
        }
    }

    /// Stop the dispatch pump and heartbeat service.
    pub fn shutdown(&self) {
        self.pump.abort();
        self.heartbeat.abort();
    }
}

impl Drop for NodeRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("local", self.cluster.local())
            .finish_non_exhaustive()
    }
}
