//! Periodic heartbeat broadcast and staleness eviction.

use std::sync::Arc;
use std::time::Duration;

use reef_cluster::{Cluster, unix_millis};
use reef_net::{Message, Wire};
use reef_types::Heartbeat;
use tracing::info;

use crate::dkv::Dkv;

/// Broadcasts this node's health snapshot to every known peer and drops
/// silent members from the view.
///
/// Heartbeat staleness is one of the only two timeouts in the protocol
/// (the other being socket-level ones); everything else waits on peer
/// liveness.
pub struct HeartbeatService {
    cluster: Arc<Cluster>,
    wire: Arc<dyn Wire>,
    dkv: Arc<Dkv>,
    interval: Duration,
    staleness: Duration,
}

impl HeartbeatService {
    /// Create the service.
    pub fn new(
        cluster: Arc<Cluster>,
        wire: Arc<dyn Wire>,
        dkv: Arc<Dkv>,
        interval: Duration,
        staleness: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            wire,
            dkv,
            interval,
            staleness,
        })
    }

    /// Run forever, beating once per interval.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.beat().await;
        }
    }

    /// One round: send our snapshot to every interned peer (members and
    /// not-yet-members alike — that is how seeds learn we exist), then
    /// evict members we have not heard from within the staleness window.
    pub async fn beat(&self) {
        let view = self.cluster.view();
        let beat = Heartbeat {
            view_id: view.id(),
            keys: self.dkv.home_len() as u64,
            free_mem: available_memory(),
            sent_at_ms: unix_millis(),
        };
        let members: Vec<_> = view.members().iter().map(|m| m.addr()).collect();

        for node in self.cluster.registry().nodes() {
            if Arc::ptr_eq(&node, self.cluster.local()) {
                continue;
            }
            // Best-effort; an unreachable peer ages out via staleness.
            let _ = self
                .wire
                .send(node.addr(), Message::Heartbeat {
                    beat,
                    members: members.clone(),
                })
                .await;
        }

        let now = unix_millis();
        let max_silence = self.staleness.as_millis() as u64;
        let fresh: Vec<_> = view
            .members()
            .iter()
            .filter(|m| Arc::ptr_eq(m, self.cluster.local()) || !m.is_stale(now, max_silence))
            .cloned()
            .collect();
        if fresh.len() < view.len() {
            info!(
                dropped = view.len() - fresh.len(),
                "evicting silent members from the view"
            );
            self.cluster.install_members(fresh);
        }
    }
}

/// Available system memory in bytes, read from `/proc/meminfo`.
/// Returns 0 on non-Linux platforms or if the file cannot be read.
fn available_memory() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let Some(kb_str) = rest.split_whitespace().next() else {
                return 0;
            };
            return kb_str.parse::<u64>().unwrap_or(0) * 1024;
        }
    }
    0
}
