//! Push side of a replication session (runs on the listener).
//!
//! Sends deltas, full states or clock summaries to one remote peer, steered
//! by the presentations that peer sends back.

use super::ProtocolContext;
use super::debounce::Debounce;
use crate::error::{ReplicationError, ReplicationResult};
use crate::keys::seal_record;
use crate::telemetry::pretty_clock;
use meshsync_proto::{DataMessage, NamedState, Presentation, SyncMessage, VectorClock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct PushProtocol {
    ctx: ProtocolContext,
    /// Eager mode: push data. Lazy mode: push clock summaries only.
    pushing: bool,
    /// The remote is a pinner.
    is_pinner: bool,
    /// Last clock summary sent in lazy mode.
    sent_clock: VectorClock,
    /// What the remote is assumed to hold after our pushes.
    remote_clock: VectorClock,
    debounce: Debounce,
}

impl PushProtocol {
    pub fn new(ctx: ProtocolContext) -> Self {
        let debounce = Debounce::new(ctx.options.debounce_push());
        Self {
            ctx,
            pushing: true,
            is_pinner: false,
            sent_clock: VectorClock::new(),
            remote_clock: VectorClock::new(),
            debounce,
        }
    }

    pub fn is_pushing(&self) -> bool {
        self.pushing
    }

    /// Serve the session until the inbox closes, `cancel` fires or an error
    /// occurs. Per-peer bookkeeping is torn down on every exit path.
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

    async fn serve(
        &mut self,
        inbox: &mut mpsc::Receiver<SyncMessage>,
        clock_rx: &mut watch::Receiver<VectorClock>,
        cancel: &CancellationToken,
    ) -> ReplicationResult {
        self.ctx.outbox.send(SyncMessage::Data(DataMessage::peer_info(
            self.ctx.options.replicate_only,
        )))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = inbox.recv() => match message {
                    Some(SyncMessage::Presentation(presentation)) => {
                        self.on_presentation(presentation).await?;
                    }
                    Some(other) => return Err(ReplicationError::UnexpectedMessage(other.kind())),
                    None => return Ok(()),
                },
                changed = clock_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let clock = clock_rx.borrow_and_update().clone();
                    self.ctx.clocks.set_for(&self.ctx.local, &clock, false, false);
                    self.debounce.trigger();
                }
                _ = self.debounce.wait() => self.reduce_entropy().await?,
            }
        }
    }

    async fn on_presentation(&mut self, presentation: Presentation) -> ReplicationResult {
        if presentation.start_lazy {
            self.pushing = false;
        }
        if presentation.start_eager {
            self.pushing = true;
        }
        if let Some(is_pinner) = presentation.is_pinner {
            self.set_pinner(is_pinner);
        }

        let had_clock = presentation.clock.is_some();
        if let Some(clock) = presentation.clock {
            let stored = self
                .ctx
                .clocks
                .set_for(&self.ctx.remote, &clock, false, self.is_pinner);
            debug!(
                peer = %self.ctx.remote,
                clock = %pretty_clock(&self.ctx.names, &stored),
                "Remote clock"
            );
            self.ctx
                .replication
                .sent(&self.ctx.remote, &stored, self.is_pinner);
            self.remote_clock = stored;
        }

        if had_clock || presentation.start_eager {
            self.reduce_entropy().await?;
        }
        Ok(())
    }

    fn set_pinner(&mut self, is_pinner: bool) {
        self.is_pinner = is_pinner;
        self.debounce.set_delay(if is_pinner {
            self.ctx.options.debounce_push_to_pinner()
        } else {
            self.ctx.options.debounce_push()
        });
        self.ctx.clocks.mark_pinner(&self.ctx.remote, is_pinner);
        if is_pinner {
            self.ctx.replication.add_pinner(&self.ctx.remote);
        } else {
            self.ctx.replication.remove_pinner(&self.ctx.remote);
        }
    }

    /// What the remote holds: its last reported clock, plus what we pushed
    /// since. A pinner's report alone is authoritative.
    fn assumed_remote_clock(&self) -> VectorClock {
        let reported = self.ctx.clocks.get_for(&self.ctx.remote);
        if self.is_pinner {
            reported
        } else {
            reported.merged(&self.remote_clock)
        }
    }

    /// One entropy-reduction pass.
    async fn reduce_entropy(&mut self) -> ReplicationResult {
        self.debounce.cancel();
        let local_clock = self.ctx.shared.clock();
        let remote_clock = self.assumed_remote_clock();
        if VectorClock::does_second_have_first(&local_clock, &remote_clock) {
            return Ok(());
        }

        if !self.pushing {
            return self.push_clock(local_clock);
        }

        self.ctx
            .replication
            .sending(&self.ctx.remote, &local_clock, self.is_pinner);
        self.remote_clock = remote_clock;
        if !self.is_pinner && !self.ctx.options.replicate_only {
            self.remote_clock = self.push_deltas().await?;
        }
        if self.is_pinner || !VectorClock::does_second_have_first(&local_clock, &self.remote_clock) {
            self.remote_clock = self.push_state().await?;
        }
        Ok(())
    }

    /// Send the deltas the remote lacks. Returns the clock it will hold.
    async fn push_deltas(&mut self) -> ReplicationResult<VectorClock> {
        let mut remote_clock = self.remote_clock.clone();
        let deltas = self.ctx.shared.deltas(&remote_clock);
        let count = deltas.len();
        for delta in deltas {
            let resulting = delta.resulting_clock();
            let sealed = seal_record(self.ctx.keys(), self.ctx.options.replicate_only, delta).await?;
            self.ctx.outbox.send(SyncMessage::Data(DataMessage::delta(sealed)))?;
            remote_clock.merge(&resulting);
        }
        debug!(peer = %self.ctx.remote, count, "Pushed deltas");
        Ok(remote_clock)
    }

    /// Send the full state of this collaboration and its direct children.
    async fn push_state(&mut self) -> ReplicationResult<VectorClock> {
        let clock = self.ctx.clocks.set_for(
            &self.ctx.local,
            &self.ctx.shared.clock(),
            false,
            false,
        );
        let Some(root) = self.ctx.shared.state_as_delta() else {
            return Ok(self.remote_clock.clone());
        };

        let keys = self.ctx.keys();
        let replicate_only = self.ctx.options.replicate_only;
        let mut states = vec![NamedState {
            name: None,
            record: seal_record(keys, replicate_only, root).await?,
        }];
        for (name, child) in self.ctx.children() {
            if let Some(record) = child.state_as_delta() {
                states.push(NamedState {
                    name: Some(name),
                    record: seal_record(keys, replicate_only, record).await?,
                });
            }
        }

        debug!(
            peer = %self.ctx.remote,
            clock = %pretty_clock(&self.ctx.names, &clock),
            states = states.len(),
            "Pushed full state"
        );
        self.ctx
            .outbox
            .send(SyncMessage::Data(DataMessage::states(clock.clone(), states)))?;
        Ok(clock)
    }

    /// Lazy mode: announce the entries that changed since the last summary.
    fn push_clock(&mut self, local_clock: VectorClock) -> ReplicationResult {
        let diff = VectorClock::diff(&self.sent_clock, &local_clock);
        if diff.is_empty() {
            return Ok(());
        }
        debug!(
            peer = %self.ctx.remote,
            clock = %pretty_clock(&self.ctx.names, &diff),
            "Pushed clock summary"
        );
        self.ctx
            .outbox
            .send(SyncMessage::Data(DataMessage::clock_only(diff)))?;
        self.sent_clock = local_clock;
        Ok(())
    }

    fn teardown(&mut self) {
        self.debounce.cancel();
        self.ctx.clocks.take_down(&self.ctx.remote);
        if self.is_pinner {
            self.ctx.replication.remove_pinner(&self.ctx.remote);
        }
    }
}
