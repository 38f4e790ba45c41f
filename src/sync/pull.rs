//! Pull side of a replication session (runs on the dialer).
//!
//! Announces the local clock, applies what the remote pushes, and steers
//! the remote between eager and lazy mode.

use super::ProtocolContext;
use super::wait_timers::WaitTimers;
use crate::error::{ReplicationError, ReplicationResult};
use crate::keys::open_record;
use crate::telemetry::pretty_clock;
use meshsync_proto::{DataMessage, NamedState, NewStates, Presentation, SyncMessage, VectorClock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct PullProtocol {
    ctx: ProtocolContext,
    remote_is_pinner: bool,
    /// Mode last requested from the remote push side.
    eager: bool,
    timers: WaitTimers,
}

impl PullProtocol {
    pub fn new(ctx: ProtocolContext) -> Self {
        let timers = WaitTimers::new(ctx.options.receive_timeout());
        Self {
            ctx,
            remote_is_pinner: false,
            eager: true,
            timers,
        }
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<SyncMessage>,
        cancel: CancellationToken,
    ) -> ReplicationResult {
        let mut clock_rx = self.ctx.shared.subscribe_clock();
        clock_rx.borrow_and_update();

        let result = self.serve(&mut inbox, &mut clock_rx, &cancel).await;
        self.teardown();
        result
    }

    /// Forget everything this session learned about the remote.
    fn teardown(&mut self) {
        self.timers.stop();
        if self.remote_is_pinner {
            self.ctx.replication.remove_pinner(&self.ctx.remote);
        }
        self.ctx.clocks.take_down(&self.ctx.remote);
    }

    async fn serve(
        &mut self,
        inbox: &mut mpsc::Receiver<SyncMessage>,
        clock_rx: &mut watch::Receiver<VectorClock>,
        cancel: &CancellationToken,
    ) -> ReplicationResult {
        self.ctx
            .outbox
            .send(SyncMessage::Presentation(Presentation::init(
                self.ctx.shared.clock(),
                self.ctx.options.replicate_only,
            )))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = inbox.recv() => match message {
                    Some(SyncMessage::Data(data)) => self.on_data(data).await?,
                    Some(other) => return Err(ReplicationError::UnexpectedMessage(other.kind())),
                    None => return Ok(()),
                },
                changed = clock_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let clock = clock_rx.borrow_and_update().clone();
                    self.ctx
                        .outbox
                        .send(SyncMessage::Presentation(Presentation::clock(clock)))?;
                }
                clock = self.timers.next_expired() => {
                    if !VectorClock::does_second_have_first(&clock, &self.ctx.shared.clock()) {
                        info!(
                            peer = %self.ctx.remote,
                            clock = %pretty_clock(&self.ctx.names, &clock),
                            "Announced data did not arrive, requesting eager mode"
                        );
                        self.set_eager()?;
                    }
                }
            }
        }
    }

    async fn on_data(&mut self, data: DataMessage) -> ReplicationResult {
        let DataMessage {
            delta,
            new_states,
            peer_info,
        } = data;

        if let Some(info) = peer_info {
            if info.is_pinner && !self.remote_is_pinner {
                debug!(peer = %self.ctx.remote, "Remote is a pinner");
                self.remote_is_pinner = true;
                self.ctx.clocks.mark_pinner(&self.ctx.remote, true);
                self.ctx.replication.add_pinner(&self.ctx.remote);
                self.set_lazy()?;
            }
            if delta.is_none() && new_states.is_none() {
                return Ok(());
            }
        }

        let clock = match (&delta, &new_states) {
            (Some(delta), _) => delta.resulting_clock(),
            (None, Some(states)) => states.clock.clone(),
            (None, None) => VectorClock::new(),
        };
        if clock.is_empty() {
            debug!(peer = %self.ctx.remote, "Ignoring message without clock");
            return Ok(());
        }

        if self.remote_is_pinner {
            self.ctx.clocks.set_for(&self.ctx.remote, &clock, false, true);
        } else {
            self.ctx.clocks.merge_for(&self.ctx.remote, &clock);
        }

        let saved = match (delta, new_states) {
            (Some(delta), _) => {
                self.receiving(&clock);
                let record = open_record(
                    self.ctx.keys(),
                    self.ctx.options.replicate_only,
                    delta,
                )
                .await?;
                self.ctx.shared.apply(record, true, false).await?
            }
            (
                None,
                Some(NewStates {
                    states: Some(states),
                    ..
                }),
            ) => {
                self.receiving(&clock);
                self.apply_states(states).await?
            }
            _ => {
                let armed = self.timers.on_clock(&clock, &self.ctx.shared.clock());
                debug!(
                    peer = %self.ctx.remote,
                    clock = %pretty_clock(&self.ctx.names, &clock),
                    armed,
                    "Clock summary"
                );
                return Ok(());
            }
        };

        if saved {
            self.ctx.replication.received(&self.ctx.remote, &clock);
            self.ctx
                .clocks
                .set_for(&self.ctx.local, &self.ctx.shared.clock(), false, false);
        } else {
            self.set_lazy()?;
        }
        Ok(())
    }

    fn receiving(&mut self, clock: &VectorClock) {
        self.timers.on_data(clock);
        self.ctx.replication.receiving(&self.ctx.remote, clock);
    }

    /// Apply the root state, then the children's if the root was new.
    async fn apply_states(&mut self, states: Vec<NamedState>) -> ReplicationResult<bool> {
        let (mut roots, subs): (Vec<_>, Vec<_>) =
            states.into_iter().partition(|state| state.name.is_none());
        let Some(root) = roots.pop() else {
            return Err(ReplicationError::MissingRootState);
        };

        let keys = self.ctx.keys();
        let replicate_only = self.ctx.options.replicate_only;
        let record = open_record(keys, replicate_only, root.record).await?;
        if !self.ctx.shared.apply(record, false, false).await? {
            return Ok(false);
        }

        for state in subs {
            let Some(name) = state.name else { continue };
            match self.ctx.child(&name) {
                Some(child) => {
                    let record = open_record(keys, replicate_only, state.record).await?;
                    child.apply(record, false, true).await?;
                }
                None => debug!(peer = %self.ctx.remote, sub = %name, "State for unknown child"),
            }
        }
        Ok(true)
    }

    fn set_lazy(&mut self) -> ReplicationResult {
        if self.eager {
            self.eager = false;
            self.ctx
                .outbox
                .send(SyncMessage::Presentation(Presentation::lazy()))?;
        }
        Ok(())
    }

    fn set_eager(&mut self) -> ReplicationResult {
        if !self.eager {
            self.eager = true;
            self.ctx
                .outbox
                .send(SyncMessage::Presentation(Presentation::eager()))?;
        }
        Ok(())
    }
}
