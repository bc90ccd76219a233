//! Cloneable client side of the coordinator

use crate::allocation::{AllocationCommand, AllocationExplanation, CommandOutcome, FailedShard, StartedShard};
use crate::common::{Error, Result};
use crate::routing::{ClusterState, DiscoveryNodes, IndexMetadata, ShardId};
use tokio::sync::{mpsc, oneshot, watch};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub(crate) enum Request {
    NodesChanged(DiscoveryNodes),
    ShardStarted(StartedShard),
    ShardFailed(FailedShard),
    Command {
        command: AllocationCommand,
        reply: Reply<CommandOutcome>,
    },
    Reroute {
        reason: String,
        reply: Reply<(ClusterState, bool)>,
    },
    CreateIndex {
        meta: IndexMetadata,
        reply: Reply<ClusterState>,
    },
    UpdateReplicas {
        index: String,
        replicas: u32,
        reply: Reply<ClusterState>,
    },
    Explain {
        shard_id: ShardId,
        reply: Reply<AllocationExplanation>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ClusterState>,
}

impl CoordinatorHandle {
    pub(crate) fn new(requests: mpsc::Sender<Request>, state: watch::Receiver<ClusterState>) -> Self {
        Self { requests, state }
    }

    /// Replace node membership. Copies on nodes that left are reconciled
    /// in the next pass.
    pub async fn on_nodes_changed(&self, nodes: DiscoveryNodes) -> Result<()> {
        Ok(self.requests.send(Request::NodesChanged(nodes)).await?)
    }

    pub async fn on_shard_started(&self, shard_id: ShardId, node_id: impl Into<String>) -> Result<()> {
        let started = StartedShard {
            shard_id,
            node_id: node_id.into(),
        };
        Ok(self.requests.send(Request::ShardStarted(started)).await?)
    }

    pub async fn on_shard_failed(
        &self,
        shard_id: ShardId,
        node_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<()> {
        let failed = FailedShard {
            shard_id,
            node_id: node_id.into(),
            reason: reason.into(),
        };
        Ok(self.requests.send(Request::ShardFailed(failed)).await?)
    }

    /// Apply a manual command in the next pass and wait for its outcome.
    pub async fn submit_command(&self, command: AllocationCommand) -> Result<CommandOutcome> {
        self.call(|reply| Request::Command { command, reply }).await
    }

    /// Run a pass now. Returns the state after the pass and whether it changed.
    pub async fn reroute(&self, reason: impl Into<String>) -> Result<(ClusterState, bool)> {
        let reason = reason.into();
        self.call(|reply| Request::Reroute { reason, reply }).await
    }

    pub async fn create_index(&self, meta: IndexMetadata) -> Result<ClusterState> {
        self.call(|reply| Request::CreateIndex { meta, reply }).await
    }

    pub async fn update_number_of_replicas(&self, index: impl Into<String>, replicas: u32) -> Result<ClusterState> {
        let index = index.into();
        self.call(|reply| Request::UpdateReplicas {
            index,
            replicas,
            reply,
        })
        .await
    }

    /// Explain a shard against the state produced by the next pass.
    pub async fn explain(&self, shard_id: ShardId) -> Result<AllocationExplanation> {
        self.call(|reply| Request::Explain { shard_id, reply }).await
    }

    /// Latest published snapshot.
    pub fn state(&self) -> ClusterState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClusterState> {
        self.state.clone()
    }

    /// Ask the writer to stop once queued events are processed.
    pub async fn shutdown(&self) -> Result<()> {
        Ok(self.requests.send(Request::Shutdown).await?)
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(build(tx)).await?;
        rx.await.map_err(|_| Error::CoordinatorClosed)?
    }
}
