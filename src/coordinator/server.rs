//! Coordinator writer task

use crate::allocation::{AllocationExplanation, AllocationService, CommandOutcome, RerouteTrigger};
use crate::common::{Error, Result};
use crate::coordinator::handle::{CoordinatorHandle, Reply, Request};
use crate::routing::{ClusterState, RecoveryRequest, ShardId};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the inbound event queue
const REQUEST_QUEUE_CAPACITY: usize = 1024;

/// Replies owed to callers once the pass they joined has finished.
enum Waiter {
    Command { index: usize, reply: Reply<CommandOutcome> },
    Reroute(Reply<(ClusterState, bool)>),
    State(Reply<ClusterState>),
    Explain {
        shard_id: ShardId,
        reply: Reply<AllocationExplanation>,
    },
}

pub struct AllocationCoordinator {
    state: ClusterState,
    service: Arc<AllocationService>,
    requests: mpsc::Receiver<Request>,
    published: watch::Sender<ClusterState>,
    recoveries: mpsc::UnboundedSender<RecoveryRequest>,
}

impl AllocationCoordinator {
    /// Start the writer task. Recovery requests are sent on `recovery_tx`.
    pub fn spawn(
        initial_state: ClusterState,
        service: Arc<AllocationService>,
        recovery_tx: mpsc::UnboundedSender<RecoveryRequest>,
    ) -> (CoordinatorHandle, JoinHandle<Result<()>>) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(initial_state.clone());

        let coordinator = AllocationCoordinator {
            state: initial_state,
            service,
            requests: request_rx,
            published: state_tx,
            recoveries: recovery_tx,
        };
        let task = tokio::spawn(coordinator.run());
        (CoordinatorHandle::new(request_tx, state_rx), task)
    }

    async fn run(mut self) -> Result<()> {
        info!(version = self.state.version(), "Allocation coordinator started");

        while let Some(first) = self.requests.recv().await {
            let mut batch = vec![first];
            while let Ok(next) = self.requests.try_recv() {
                batch.push(next);
            }

            let shutdown = batch.iter().any(|r| matches!(r, Request::Shutdown));
            match self.process(batch) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, version = self.state.version(), "Reroute failed, coordinator stopping");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, version = self.state.version(), "Reroute refused, batch dropped");
                }
            }
            if shutdown {
                break;
            }
        }

        info!(version = self.state.version(), "Allocation coordinator stopped");
        Ok(())
    }

    /// Run one pass over a batch of coalesced requests. When the pass
    /// fails every waiter gets the error and nothing is published.
    fn process(&mut self, batch: Vec<Request>) -> Result<()> {
        debug!(events = batch.len(), "Processing batch");
        let at = Utc::now();
        let mut working = self.state.clone();
        let mut trigger = RerouteTrigger::new("coordinator").at(at);
        let mut reasons: Vec<&'static str> = Vec::new();
        let mut waiters = Vec::new();

        for request in batch {
            match request {
                Request::NodesChanged(nodes) => {
                    working = working.with_nodes(nodes);
                    reasons.push("nodes changed");
                }
                Request::ShardStarted(started) => {
                    trigger.started.push(started);
                    reasons.push("shard started");
                }
                Request::ShardFailed(failed) => {
                    trigger.failed.push(failed);
                    reasons.push("shard failed");
                }
                Request::Command { command, reply } => {
                    waiters.push(Waiter::Command {
                        index: trigger.commands.len(),
                        reply,
                    });
                    trigger.commands.push(command);
                    reasons.push("allocation command");
                }
                Request::Reroute { reason, reply } => {
                    debug!(reason = %reason, "Reroute requested");
                    waiters.push(Waiter::Reroute(reply));
                    reasons.push("reroute requested");
                }
                Request::CreateIndex { meta, reply } => match working.with_index(meta, at) {
                    Ok(next) => {
                        working = next;
                        waiters.push(Waiter::State(reply));
                        reasons.push("index created");
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                Request::UpdateReplicas {
                    index,
                    replicas,
                    reply,
                } => match working.with_number_of_replicas(&index, replicas, at) {
                    Ok(next) => {
                        working = next;
                        waiters.push(Waiter::State(reply));
                        reasons.push("replicas updated");
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                Request::Explain { shard_id, reply } => {
                    waiters.push(Waiter::Explain { shard_id, reply });
                }
                Request::Shutdown => {}
            }
        }
        reasons.dedup();
        if !reasons.is_empty() {
            trigger.reason = reasons.join(", ");
        }

        let result = match self.service.reroute(&working, trigger) {
            Ok(result) => result,
            Err(e) => {
                for waiter in waiters {
                    waiter.fail(&e);
                }
                return Err(e);
            }
        };

        let published = working.version() != self.state.version() || result.changed;
        self.state = result.state;
        if published {
            self.published.send_replace(self.state.clone());
            debug!(version = self.state.version(), "Published cluster state");
        }

        for recovery in result.recoveries {
            if self.recoveries.send(recovery).is_err() {
                warn!("Recovery receiver dropped, recovery request discarded");
            }
        }

        let mut outcomes: Vec<Option<CommandOutcome>> =
            result.command_outcomes.into_iter().map(Some).collect();
        for waiter in waiters {
            match waiter {
                Waiter::Command { index, reply } => {
                    let outcome = outcomes
                        .get_mut(index)
                        .and_then(Option::take)
                        .ok_or_else(|| Error::Internal(format!("missing outcome for command {}", index)));
                    let _ = reply.send(outcome);
                }
                Waiter::Reroute(reply) => {
                    let _ = reply.send(Ok((self.state.clone(), result.changed)));
                }
                Waiter::State(reply) => {
                    let _ = reply.send(Ok(self.state.clone()));
                }
                Waiter::Explain { shard_id, reply } => {
                    let _ = reply.send(self.service.explain(&self.state, &shard_id));
                }
            }
        }
        Ok(())
    }
}

impl Waiter {
    fn fail(self, cause: &Error) {
        let err = || cause.duplicate();
        match self {
            Waiter::Command { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Waiter::Reroute(reply) => {
                let _ = reply.send(Err(err()));
            }
            Waiter::State(reply) => {
                let _ = reply.send(Err(err()));
            }
            Waiter::Explain { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
        }
    }
}
