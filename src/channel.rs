//! The channel controller.
//!
//! A [`Channel`] binds one state machine to one peer connection filtered
//! for its channel id and runs the opening, update and settlement
//! protocols. The machine lock is only ever held for in-memory work;
//! every network, funder and adjudicator await happens between lock
//! sections.

pub mod machine;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::adjudicator::{Adjudicator, AdjudicatorError, Funder, FundingError, FundingReq};
use crate::ctx::{CancelHandle, Ctx, CtxError};
use crate::peer::{Peer, PeerError};
use crate::persist::{PersistError, Persister};
use crate::sig::Account;
use crate::types::{ChannelId, PartIdx};
use crate::wire::{self, Interest, Message, UpdateAcc, UpdateRej, UpdateReq};

use machine::{MachineError, Phase, StateMachine};
use state::{Allocation, Params, State};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("peer rejected the update: {reason}")]
    PeerRejected { reason: String },
    #[error("update superseded by a simultaneous update from the peer")]
    SimultaneousUpdate,
    #[error("another update round is in progress")]
    Busy,
    #[error("only final channels can be settled")]
    NotFinal,
    #[error("adjudicator registered version {got}, expected {expected}")]
    UnexpectedRegisteredVersion { expected: u64, got: u64 },
    #[error("channel is closed")]
    Closed,
    #[error("peer violated the protocol: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error("connection failure")]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Ctx(#[from] CtxError),
    #[error("funding failed")]
    Funding(#[source] FundingError),
    #[error("settling failed")]
    Adjudicator(#[from] AdjudicatorError),
    #[error("persisting channel state failed")]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Allocation(#[from] state::AllocationError),
}

/// Notification passed to the [`UpdateHandler`] for an inbound update that
/// passed all protocol checks.
#[derive(Debug)]
pub struct UpdateNotice {
    pub channel_id: ChannelId,
    /// Who proposed the update.
    pub actor: PartIdx,
    /// The committed state the update is based on.
    pub current: State,
    /// The proposed new state, already staged for signing.
    pub proposed: State,
}

/// Application hook deciding inbound updates.
///
/// The handler must consume the responder by calling exactly one of
/// [`UpdateResponder::accept`] or [`UpdateResponder::reject`]; the move
/// makes a second call unrepresentable.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle(&self, notice: UpdateNotice, responder: UpdateResponder);
}

/// Accepts every update. The payment application carries no data, so there
/// is nothing beyond the transition rules to check.
#[derive(Debug, Default)]
pub struct AcceptAllUpdates;

#[async_trait]
impl UpdateHandler for AcceptAllUpdates {
    async fn handle(&self, notice: UpdateNotice, responder: UpdateResponder) {
        if let Err(error) = responder.accept(&Ctx::background()).await {
            tracing::warn!(channel = ?notice.channel_id, %error, "accepting update failed");
        }
    }
}

/// An in-flight initiator round, used to arbitrate simultaneous updates.
struct InFlight {
    version: u64,
    /// The inbound task sends an ack-sender here to force this round into
    /// a synthetic rejection; the initiator acks once it has discarded.
    abort: Option<oneshot::Sender<oneshot::Sender<()>>>,
}

struct Shared {
    channel_id: ChannelId,
    idx: PartIdx,
    peer_idx: PartIdx,
    peer: Arc<Peer>,
    machine: StdRwLock<StateMachine>,
    funder: Arc<dyn Funder>,
    adjudicator: Arc<dyn Adjudicator>,
    persister: Option<Arc<dyn Persister>>,
    update_handler: Arc<dyn UpdateHandler>,
    in_flight: StdMutex<Option<InFlight>>,
    inbound_cancel: CancelHandle,
    closed: AtomicBool,
}

/// Controller for one open channel. Clones share the same channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.channel_id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Channel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        acc: Account,
        params: Params,
        idx: PartIdx,
        peer: Arc<Peer>,
        funder: Arc<dyn Funder>,
        adjudicator: Arc<dyn Adjudicator>,
        persister: Option<Arc<dyn Persister>>,
        update_handler: Arc<dyn UpdateHandler>,
    ) -> Result<Channel, ChannelError> {
        let machine = StateMachine::new(acc, params, idx)?;
        Ok(Self::from_machine(
            machine,
            peer,
            funder,
            adjudicator,
            persister,
            update_handler,
        ))
    }

    /// Rebuilds a controller from a persisted log; the machine resumes in
    /// its last persisted phase.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        acc: Account,
        params: Params,
        idx: PartIdx,
        peer: Arc<Peer>,
        funder: Arc<dyn Funder>,
        adjudicator: Arc<dyn Adjudicator>,
        persister: Arc<dyn Persister>,
        update_handler: Arc<dyn UpdateHandler>,
    ) -> Result<Channel, ChannelError> {
        let channel_id = params.id().map_err(MachineError::from)?;
        let log = persister.log(channel_id)?;
        let machine = StateMachine::restore(acc, params, idx, &log)?;
        Ok(Self::from_machine(
            machine,
            peer,
            funder,
            adjudicator,
            Some(persister),
            update_handler,
        ))
    }

    fn from_machine(
        machine: StateMachine,
        peer: Arc<Peer>,
        funder: Arc<dyn Funder>,
        adjudicator: Arc<dyn Adjudicator>,
        persister: Option<Arc<dyn Persister>>,
        update_handler: Arc<dyn UpdateHandler>,
    ) -> Channel {
        let channel_id = machine.channel_id();
        let (inbound_ctx, inbound_cancel) = Ctx::background().with_cancel();
        let shared = Arc::new(Shared {
            channel_id,
            idx: machine.idx(),
            peer_idx: machine.peer_idx(),
            peer,
            machine: StdRwLock::new(machine),
            funder,
            adjudicator,
            persister,
            update_handler,
            in_flight: StdMutex::new(None),
            inbound_cancel,
            closed: AtomicBool::new(false),
        });
        tokio::spawn(inbound_loop(shared.clone(), inbound_ctx));
        Channel { shared }
    }

    pub fn id(&self) -> ChannelId {
        self.shared.channel_id
    }

    pub fn idx(&self) -> PartIdx {
        self.read().idx()
    }

    pub fn params(&self) -> Params {
        self.read().params().clone()
    }

    /// Snapshot of the committed state; `None` until the channel opened.
    pub fn state(&self) -> Option<State> {
        self.read().state().cloned()
    }

    pub fn phase(&self) -> Phase {
        self.read().phase()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StateMachine> {
        self.shared.machine.read().expect("machine lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StateMachine> {
        self.shared.machine.write().expect("machine lock poisoned")
    }

    /// Runs the opening protocol: stage and sign the initial state,
    /// exchange signatures, fund.
    ///
    /// On a funding timeout the channel moves to `Aborted`, is closed, and
    /// the error reports which participants failed to deposit.
    pub(crate) async fn open(
        &self,
        ctx: &Ctx,
        allocation: Allocation,
        app_data: Vec<u8>,
    ) -> Result<(), ChannelError> {
        let shared = &self.shared;
        let mut sub = shared.peer.subscribe(Interest::UpdateResponses {
            channel: shared.channel_id,
            version: 0,
        })?;

        let (sig, idx, peer_idx, params) = {
            let mut m = self.write();
            m.init(allocation.clone(), app_data)?;
            let sig = m.sig()?;
            (sig, m.idx(), m.peer_idx(), m.params().clone())
        };

        // Send our signature and await the peer's concurrently; the writer
        // task buffers the send, so plain send-then-receive cannot
        // deadlock with the peer doing the same.
        shared
            .peer
            .send(
                ctx,
                &Message::UpdateAcc(UpdateAcc {
                    channel_id: shared.channel_id,
                    version: 0,
                    sig,
                }),
            )
            .await?;

        match sub.recv(ctx).await? {
            Message::UpdateAcc(acc) => {
                let mut m = self.write();
                m.add_sig(peer_idx, acc.sig)?;
                m.enable_init()?;
                self.persist(&m)?;
            }
            Message::UpdateRej(rej) => {
                return Err(ChannelError::PeerRejected { reason: rej.reason });
            }
            other => {
                return Err(ChannelError::ProtocolViolation(format!(
                    "unexpected {} during opening",
                    other.name()
                )));
            }
        }
        drop(sub);

        tracing::debug!(channel = ?shared.channel_id, "initial state signed, funding");
        let req = FundingReq {
            params,
            idx,
            allocation,
        };
        match shared.funder.fund(ctx, req).await {
            Ok(()) => {
                self.write().set_funded()?;
                tracing::info!(channel = ?shared.channel_id, "channel open");
                Ok(())
            }
            Err(error) => {
                self.write().set_aborted()?;
                self.close();
                Err(ChannelError::Funding(error))
            }
        }
    }

    /// Proposes `new_state` to the peer and drives the round to
    /// completion. Whatever happens, the machine is back in a committed
    /// phase (`Acting`/`Final`) when this returns.
    pub async fn update(&self, ctx: &Ctx, new_state: State) -> Result<(), ChannelError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let shared = &self.shared;
        let version = new_state.version();
        let mut sub = shared.peer.subscribe(Interest::UpdateResponses {
            channel: shared.channel_id,
            version,
        })?;

        // Lock order is in-flight before machine, here and in the inbound
        // task; holding both closes the window in which a colliding
        // inbound request could observe the staged state without the
        // in-flight marker.
        let (abort_tx, abort_rx) = oneshot::channel();
        let sig = {
            let mut in_flight = lock_in_flight(shared);
            let mut m = self.write();
            match m.update(new_state.clone()) {
                Ok(()) => {}
                Err(MachineError::PhaseViolation {
                    phase: Phase::Signing,
                    ..
                }) => return Err(ChannelError::Busy),
                Err(e) => return Err(e.into()),
            }
            let sig = match m.sig() {
                Ok(sig) => sig,
                Err(e) => {
                    let _ = m.discard_update();
                    return Err(e.into());
                }
            };
            *in_flight = Some(InFlight {
                version,
                abort: Some(abort_tx),
            });
            sig
        };

        let req = Message::UpdateReq(UpdateReq {
            channel_id: shared.channel_id,
            state: new_state,
            actor_idx: shared.idx as u16,
            sig,
        });
        if let Err(e) = shared.peer.send(ctx, &req).await {
            self.abandon_round();
            return Err(e.into());
        }

        enum Outcome {
            Response(Result<Message, PeerError>),
            Superseded(Option<oneshot::Sender<()>>),
        }
        let outcome = tokio::select! {
            msg = sub.recv(ctx) => Outcome::Response(msg),
            ack = abort_rx => Outcome::Superseded(ack.ok()),
        };

        match outcome {
            Outcome::Response(Ok(Message::UpdateAcc(acc))) => {
                lock_in_flight(shared).take();
                let mut m = self.write();
                if let Err(e) = m
                    .add_sig(shared.peer_idx, acc.sig)
                    .and_then(|()| m.enable())
                {
                    let _ = m.discard_update();
                    return Err(e.into());
                }
                self.persist(&m)?;
                Ok(())
            }
            Outcome::Response(Ok(Message::UpdateRej(rej))) => {
                self.abandon_round();
                Err(ChannelError::PeerRejected { reason: rej.reason })
            }
            Outcome::Response(Ok(other)) => {
                self.abandon_round();
                Err(ChannelError::ProtocolViolation(format!(
                    "unexpected {} as update response",
                    other.name()
                )))
            }
            Outcome::Response(Err(e)) => {
                self.abandon_round();
                Err(e.into())
            }
            Outcome::Superseded(ack) => {
                // Forced into the responder role by the tie-break; discard
                // our round, then let the inbound task proceed.
                self.abandon_round();
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                Err(ChannelError::SimultaneousUpdate)
            }
        }
    }

    /// Convenience wrapper: propose the next state with `amount` of
    /// `asset` moved from us to the peer.
    pub async fn transfer(
        &self,
        ctx: &Ctx,
        asset: usize,
        amount: crate::types::U256,
    ) -> Result<(), ChannelError> {
        let next = {
            let m = self.read();
            let current = m.state().ok_or(MachineError::NoCommittedState)?;
            let mut next = current.make_next();
            next.transfer(asset, self.shared.idx, self.shared.peer_idx, amount)?;
            next
        };
        self.update(ctx, next).await
    }

    /// Proposes a final state with the current allocation, closing the
    /// channel cooperatively once accepted.
    pub async fn close_normal(&self, ctx: &Ctx) -> Result<(), ChannelError> {
        let next = {
            let m = self.read();
            let current = m.state().ok_or(MachineError::NoCommittedState)?;
            let mut next = current.make_next();
            next.finalize();
            next
        };
        self.update(ctx, next).await
    }

    /// Registers the final state with the adjudicator, waits out a
    /// withdrawal timeout if one is reported, and withdraws. Resumable:
    /// when the persisted phase already passed a step, the step is
    /// skipped.
    pub async fn settle(&self, ctx: &Ctx) -> Result<(), ChannelError> {
        let shared = &self.shared;
        let (req, entry_phase) = {
            let mut m = self.write();
            let phase = m.phase();
            match phase {
                Phase::Final => {
                    m.set_registering()?;
                }
                // Resuming a previously interrupted settlement.
                Phase::Registering | Phase::Registered | Phase::Withdrawing => {}
                _ => return Err(ChannelError::NotFinal),
            }
            (m.adjudicator_req()?, m.phase())
        };

        if entry_phase == Phase::Registering {
            let reg = match shared.adjudicator.register(ctx, &req).await {
                Ok(reg) => reg,
                Err(AdjudicatorError::Ctx(e)) => {
                    // Cancellation rolls back to the pre-register phase;
                    // genuine adjudicator failures stay registering so a
                    // retry resumes (nothing was persisted yet).
                    self.write().revert_registering()?;
                    return Err(ChannelError::Ctx(e));
                }
                Err(e) => return Err(e.into()),
            };
            {
                let mut m = self.write();
                m.set_registered()?;
                self.persist(&m)?;
            }
            if reg.version != req.state.version() {
                return Err(ChannelError::UnexpectedRegisteredVersion {
                    expected: req.state.version(),
                    got: reg.version,
                });
            }
            if let Some(timeout) = reg.withdrawal_timeout {
                if timeout > tokio::time::Instant::now() {
                    tracing::warn!(
                        channel = ?shared.channel_id,
                        "withdrawal timeout in the future, waiting"
                    );
                    ctx.run(tokio::time::sleep_until(timeout)).await?;
                }
            }
        }

        if self.phase() == Phase::Registered {
            self.write().set_withdrawing()?;
        }
        shared.adjudicator.withdraw(ctx, &req).await?;
        {
            let mut m = self.write();
            m.set_withdrawn()?;
            self.persist(&m)?;
        }
        tracing::info!(channel = ?shared.channel_id, "channel settled");
        Ok(())
    }

    /// Stops the inbound task and releases the channel's subscriptions.
    /// The peer connection itself stays with the registry.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.inbound_cancel.cancel();
        tracing::debug!(channel = ?self.shared.channel_id, "channel closed");
    }

    fn persist(&self, m: &StateMachine) -> Result<(), ChannelError> {
        if let Some(persister) = &self.shared.persister {
            persister.append(self.shared.channel_id, m.record()?)?;
        }
        Ok(())
    }

    /// Rolls a failed initiator round back to `Acting` and clears the
    /// in-flight marker. Never leaves the machine in `Signing`.
    fn abandon_round(&self) {
        lock_in_flight(&self.shared).take();
        let mut m = self.write();
        if m.phase() == Phase::Signing {
            if let Err(error) = m.discard_update() {
                tracing::error!(channel = ?self.shared.channel_id, %error, "discard failed");
            }
        }
    }
}

fn lock_in_flight(shared: &Shared) -> std::sync::MutexGuard<'_, Option<InFlight>> {
    shared.in_flight.lock().expect("in-flight lock poisoned")
}

/// Responder handed to the [`UpdateHandler`]; consuming it enforces the
/// exactly-once discipline.
pub struct UpdateResponder {
    shared: Arc<Shared>,
    version: u64,
}

impl UpdateResponder {
    /// Countersigns the staged update, sends the acceptance and commits.
    pub async fn accept(self, ctx: &Ctx) -> Result<(), ChannelError> {
        let sig = {
            let mut m = self.shared.machine.write().expect("machine lock poisoned");
            m.sig()?
        };
        let acc = Message::UpdateAcc(UpdateAcc {
            channel_id: self.shared.channel_id,
            version: self.version,
            sig,
        });
        if let Err(e) = self.shared.peer.send(ctx, &acc).await {
            // The peer cannot commit without our signature; fall back to
            // the committed state rather than staying in Signing.
            let mut m = self.shared.machine.write().expect("machine lock poisoned");
            let _ = m.discard_update();
            return Err(e.into());
        }
        let mut m = self.shared.machine.write().expect("machine lock poisoned");
        m.enable()?;
        if let Some(persister) = &self.shared.persister {
            persister.append(self.shared.channel_id, m.record()?)?;
        }
        Ok(())
    }

    /// Rejects the staged update and rolls back to `Acting`.
    pub async fn reject(self, ctx: &Ctx, reason: &str) -> Result<(), ChannelError> {
        let rej = Message::UpdateRej(UpdateRej {
            channel_id: self.shared.channel_id,
            version: self.version,
            reason: wire::clamp_reason(reason),
        });
        let send_res = self.shared.peer.send(ctx, &rej).await;
        {
            let mut m = self.shared.machine.write().expect("machine lock poisoned");
            m.discard_update()?;
        }
        send_res.map_err(ChannelError::from)
    }
}

/// Long-running task handling inbound update requests for one channel.
async fn inbound_loop(shared: Arc<Shared>, ctx: Ctx) {
    let mut sub = match shared.peer.subscribe(Interest::UpdateReqs {
        channel: shared.channel_id,
    }) {
        Ok(sub) => sub,
        Err(error) => {
            tracing::debug!(channel = ?shared.channel_id, %error, "no inbound subscription");
            return;
        }
    };
    loop {
        let req = match sub.recv(&ctx).await {
            Ok(Message::UpdateReq(req)) => req,
            Ok(_) => continue,
            Err(_) => return,
        };
        handle_update_req(&shared, &ctx, req).await;
    }
}

async fn handle_update_req(shared: &Arc<Shared>, ctx: &Ctx, req: UpdateReq) {
    let version = req.state.version();
    let actor = req.actor_idx as PartIdx;

    // The sender must be the update actor. Checked before the tie-break so
    // a forged actor index cannot abort our own round.
    if actor != shared.peer_idx {
        send_rej(shared, ctx, version, "sender is not the update actor").await;
        return;
    }

    // Tie-break for simultaneous updates: if we have our own round in
    // flight at this version, the lower index yields the initiator role.
    let conflict = {
        let mut in_flight = lock_in_flight(shared);
        match in_flight.as_mut() {
            Some(round) if round.version == version => {
                if shared.idx > actor {
                    Some(None)
                } else {
                    Some(round.abort.take())
                }
            }
            _ => None,
        }
    };
    match conflict {
        // We keep the initiator role; synthesize a rejection without
        // consulting the application.
        Some(None) => {
            send_rej(shared, ctx, version, "simultaneous update").await;
            return;
        }
        // We lose the initiator role; wait for our round to discard, then
        // handle the peer's request below.
        Some(Some(abort)) => {
            let (ack_tx, ack_rx) = oneshot::channel();
            if abort.send(ack_tx).is_ok() {
                let _ = ctx.run(ack_rx).await;
            } else {
                // Our round completed on its own in the meantime; it never
                // stays in Signing, so this wait is short.
                loop {
                    let phase = shared
                        .machine
                        .read()
                        .expect("machine lock poisoned")
                        .phase();
                    if phase != Phase::Signing || ctx.err().is_some() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
        None => {}
    }

    // Validate and stage under the lock; any failure rejects and leaves
    // the machine committed. The outcome is computed entirely inside the
    // locked block so the lock guard never needs to live across an await.
    enum StageOutcome {
        Busy(Phase),
        UpdateRejected(String),
        SigRejected(String),
        Staged(Option<State>),
    }
    let outcome = {
        let mut m = shared.machine.write().expect("machine lock poisoned");
        if m.phase() != Phase::Acting {
            StageOutcome::Busy(m.phase())
        } else {
            let current = m.state().cloned();
            if let Err(error) = m.update(req.state.clone()) {
                StageOutcome::UpdateRejected(error.to_string())
            } else if let Err(error) = m.add_sig(actor, req.sig) {
                let _ = m.discard_update();
                StageOutcome::SigRejected(error.to_string())
            } else {
                StageOutcome::Staged(current)
            }
        }
    };
    let current = match outcome {
        StageOutcome::Busy(phase) => {
            tracing::debug!(channel = ?shared.channel_id, %phase, "update request while busy");
            send_rej(shared, ctx, version, "channel busy").await;
            return;
        }
        StageOutcome::UpdateRejected(error) => {
            tracing::debug!(channel = ?shared.channel_id, %error, "rejecting update");
            send_rej(shared, ctx, version, &error).await;
            return;
        }
        StageOutcome::SigRejected(error) => {
            tracing::debug!(channel = ?shared.channel_id, %error, "rejecting update");
            send_rej(shared, ctx, version, &error).await;
            return;
        }
        StageOutcome::Staged(current) => current,
    };

    let notice = UpdateNotice {
        channel_id: shared.channel_id,
        actor,
        // Acting implies a committed state; the staged one is the fallback
        // only to keep this total.
        current: current.unwrap_or_else(|| req.state.clone()),
        proposed: req.state,
    };
    let responder = UpdateResponder {
        shared: shared.clone(),
        version,
    };
    let handler = shared.update_handler.clone();
    handler.handle(notice, responder).await;
}

async fn send_rej(shared: &Shared, ctx: &Ctx, version: u64, reason: &str) {
    let rej = Message::UpdateRej(UpdateRej {
        channel_id: shared.channel_id,
        version,
        reason: wire::clamp_reason(reason),
    });
    if let Err(error) = shared.peer.send(ctx, &rej).await {
        tracing::debug!(channel = ?shared.channel_id, %error, "sending rejection failed");
    }
}
