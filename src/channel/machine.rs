//! The per-channel state machine.
//!
//! Exactly one instance exists per channel, owned by the controller and
//! serialized behind its lock. Every transition is a total function over
//! [`Phase`]: an operation invoked in the wrong phase reports
//! [`MachineError::PhaseViolation`] and changes nothing. A correct
//! controller never triggers one.

use crate::adjudicator::AdjudicatorReq;
use crate::channel::state::{validate_transition, Allocation, Params, State, TransitionError};
use crate::codec::EncodeError;
use crate::persist::StateRecord;
use crate::sig::{self, Account};
use crate::types::{ChannelId, PartIdx, Signature, PARTICIPANTS};

/// Lifecycle of a channel.
///
/// The graph is forward-only except for the single back-edge
/// `Signing → Acting` taken when a proposed update is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, initial state not yet staged.
    InitActing,
    /// Initial state staged, collecting signatures.
    InitSigning,
    /// Initial state fully signed, collateral being deposited.
    Funding,
    /// Open; updates may be proposed.
    Acting,
    /// An update is staged, collecting signatures.
    Signing,
    /// A fully signed final state exists; only settlement remains.
    Final,
    Registering,
    Registered,
    Withdrawing,
    /// Terminal: funds are paid out.
    Withdrawn,
    /// Terminal: funding failed, the channel never opened.
    Aborted,
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("phase violation: {op} is not legal in phase {phase}")]
    PhaseViolation { op: &'static str, phase: Phase },
    #[error("invalid transition")]
    Transition(#[from] TransitionError),
    #[error("signature does not verify against participant {0}")]
    InvalidSignature(PartIdx),
    #[error("participant {0} already signed this state")]
    DuplicateSignature(PartIdx),
    #[error("missing signature from participant {0}")]
    MissingSignature(PartIdx),
    #[error("participant index {0} out of range")]
    BadIndex(PartIdx),
    #[error("account {0:?} is not participant {1} of this channel")]
    AccountMismatch(crate::types::Address, PartIdx),
    #[error("canonical encoding failed")]
    Encode(#[from] EncodeError),
    #[error("signing failed")]
    Sig(#[from] sig::Error),
    #[error("restore log is empty or inconsistent")]
    BadRestoreLog,
    #[error("no staged state")]
    NoStagedState,
    #[error("no committed state")]
    NoCommittedState,
}

/// A state plus the signatures collected for it so far.
#[derive(Debug, Clone)]
pub struct SignedState {
    pub state: State,
    pub sigs: [Option<Signature>; PARTICIPANTS],
}

impl SignedState {
    fn unsigned(state: State) -> Self {
        SignedState {
            state,
            sigs: [None; PARTICIPANTS],
        }
    }

    pub fn is_fully_signed(&self) -> bool {
        self.sigs.iter().all(Option::is_some)
    }

    /// All signatures, or the index of the first missing one.
    pub fn signatures(&self) -> Result<[Signature; PARTICIPANTS], MachineError> {
        let mut out = [Signature::default(); PARTICIPANTS];
        for (idx, sig) in self.sigs.iter().enumerate() {
            out[idx] = sig.ok_or(MachineError::MissingSignature(idx))?;
        }
        Ok(out)
    }
}

#[derive(Debug)]
pub struct StateMachine {
    acc: Account,
    params: Params,
    channel_id: ChannelId,
    idx: PartIdx,
    phase: Phase,
    /// Last committed fully signed state. `None` until `enable_init`.
    current: Option<SignedState>,
    /// State being signed in `InitSigning`/`Signing`.
    staged: Option<SignedState>,
}

impl StateMachine {
    pub fn new(acc: Account, params: Params, idx: PartIdx) -> Result<Self, MachineError> {
        if idx >= PARTICIPANTS {
            return Err(MachineError::BadIndex(idx));
        }
        if params.participants[idx] != acc.address() {
            return Err(MachineError::AccountMismatch(acc.address(), idx));
        }
        let channel_id = params.id()?;
        Ok(StateMachine {
            acc,
            params,
            channel_id,
            idx,
            phase: Phase::InitActing,
            current: None,
            staged: None,
        })
    }

    /// Rebuilds a machine from a persisted log, resuming in the phase of
    /// the last record.
    pub fn restore(
        acc: Account,
        params: Params,
        idx: PartIdx,
        log: &[StateRecord],
    ) -> Result<Self, MachineError> {
        let mut machine = Self::new(acc, params, idx)?;
        let last = log.last().ok_or(MachineError::BadRestoreLog)?;
        if last.state.channel_id() != machine.channel_id {
            return Err(MachineError::BadRestoreLog);
        }

        // Only committed signed states are persisted, so both signatures
        // must verify against the recorded state.
        let hash = last.state.hash()?;
        for (part, sig) in last.sigs.iter().enumerate() {
            let signer = sig::recover_signer(hash, *sig)?;
            if signer != machine.params.participants[part] {
                return Err(MachineError::InvalidSignature(part));
            }
        }

        machine.phase = last.phase;
        machine.current = Some(SignedState {
            state: last.state.clone(),
            sigs: [Some(last.sigs[0]), Some(last.sigs[1])],
        });
        Ok(machine)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn idx(&self) -> PartIdx {
        self.idx
    }

    pub fn peer_idx(&self) -> PartIdx {
        PARTICIPANTS - 1 - self.idx
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The committed state; `None` before the initial state is enabled.
    pub fn state(&self) -> Option<&State> {
        self.current.as_ref().map(|s| &s.state)
    }

    pub fn current(&self) -> Option<&SignedState> {
        self.current.as_ref()
    }

    pub fn staged_state(&self) -> Option<&State> {
        self.staged.as_ref().map(|s| &s.state)
    }

    fn staged_mut(&mut self, op: &'static str) -> Result<&mut SignedState, MachineError> {
        match self.phase {
            Phase::InitSigning | Phase::Signing => {}
            phase => return Err(MachineError::PhaseViolation { op, phase }),
        }
        // A signing phase always has a staged state.
        self.staged.as_mut().ok_or(MachineError::NoStagedState)
    }

    /// Stages the version-0 state. `InitActing → InitSigning`.
    pub fn init(&mut self, allocation: Allocation, app_data: Vec<u8>) -> Result<(), MachineError> {
        if self.phase != Phase::InitActing {
            return Err(MachineError::PhaseViolation {
                op: "init",
                phase: self.phase,
            });
        }
        let state = State::initial(self.channel_id, allocation, app_data);
        self.staged = Some(SignedState::unsigned(state));
        self.phase = Phase::InitSigning;
        Ok(())
    }

    /// Our signature over the staged state. Idempotent within the phase.
    pub fn sig(&mut self) -> Result<Signature, MachineError> {
        let acc = self.acc.clone();
        let idx = self.idx;
        let staged = self.staged_mut("sig")?;
        if let Some(sig) = staged.sigs[idx] {
            return Ok(sig);
        }
        let sig = acc.sign(staged.state.hash()?)?;
        staged.sigs[idx] = Some(sig);
        Ok(sig)
    }

    /// Adds a peer signature after verifying it against the staged state
    /// and the participant's address.
    pub fn add_sig(&mut self, part: PartIdx, sig: Signature) -> Result<(), MachineError> {
        if part >= PARTICIPANTS {
            return Err(MachineError::BadIndex(part));
        }
        let expected = self.params.participants[part];
        let staged = self.staged_mut("add_sig")?;
        if staged.sigs[part].is_some() {
            return Err(MachineError::DuplicateSignature(part));
        }
        let signer = sig::recover_signer(staged.state.hash()?, sig)?;
        if signer != expected {
            return Err(MachineError::InvalidSignature(part));
        }
        staged.sigs[part] = Some(sig);
        Ok(())
    }

    /// Commits the fully signed initial state. `InitSigning → Funding`.
    pub fn enable_init(&mut self) -> Result<(), MachineError> {
        if self.phase != Phase::InitSigning {
            return Err(MachineError::PhaseViolation {
                op: "enable_init",
                phase: self.phase,
            });
        }
        self.commit_staged()?;
        self.phase = Phase::Funding;
        Ok(())
    }

    /// `Funding → Acting`, once all deposits are confirmed.
    pub fn set_funded(&mut self) -> Result<(), MachineError> {
        self.step(Phase::Funding, Phase::Acting, "set_funded")
    }

    /// `Funding → Aborted`, when a counterparty failed to deposit.
    pub fn set_aborted(&mut self) -> Result<(), MachineError> {
        self.step(Phase::Funding, Phase::Aborted, "set_aborted")
    }

    /// Stages `new_state` for signing. `Acting → Signing`.
    pub fn update(&mut self, new_state: State) -> Result<(), MachineError> {
        if self.phase != Phase::Acting {
            return Err(MachineError::PhaseViolation {
                op: "update",
                phase: self.phase,
            });
        }
        // Acting implies a committed state exists.
        let current = self.current.as_ref().ok_or(MachineError::NoCommittedState)?;
        validate_transition(&current.state, &new_state)?;
        self.staged = Some(SignedState::unsigned(new_state));
        self.phase = Phase::Signing;
        Ok(())
    }

    /// Commits the fully signed staged update. `Signing → Acting`, or
    /// `Signing → Final` for a final state.
    pub fn enable(&mut self) -> Result<(), MachineError> {
        if self.phase != Phase::Signing {
            return Err(MachineError::PhaseViolation {
                op: "enable",
                phase: self.phase,
            });
        }
        self.commit_staged()?;
        // commit_staged just set current.
        let is_final = self.current.as_ref().map(|c| c.state.is_final()).unwrap_or(false);
        self.phase = if is_final { Phase::Final } else { Phase::Acting };
        Ok(())
    }

    /// Drops the staged update. `Signing → Acting`, the only back-edge.
    pub fn discard_update(&mut self) -> Result<(), MachineError> {
        if self.phase != Phase::Signing {
            return Err(MachineError::PhaseViolation {
                op: "discard_update",
                phase: self.phase,
            });
        }
        self.staged = None;
        self.phase = Phase::Acting;
        Ok(())
    }

    pub fn set_registering(&mut self) -> Result<(), MachineError> {
        self.step(Phase::Final, Phase::Registering, "set_registering")
    }

    /// Rolls a cancelled registration back to `Final`, so a caller whose
    /// context died mid-settle can retry later. Registration was not
    /// persisted yet, so a restart resumes from `Final` either way.
    pub fn revert_registering(&mut self) -> Result<(), MachineError> {
        self.step(Phase::Registering, Phase::Final, "revert_registering")
    }

    pub fn set_registered(&mut self) -> Result<(), MachineError> {
        self.step(Phase::Registering, Phase::Registered, "set_registered")
    }

    pub fn set_withdrawing(&mut self) -> Result<(), MachineError> {
        self.step(Phase::Registered, Phase::Withdrawing, "set_withdrawing")
    }

    pub fn set_withdrawn(&mut self) -> Result<(), MachineError> {
        self.step(Phase::Withdrawing, Phase::Withdrawn, "set_withdrawn")
    }

    /// Request payload for `register`/`withdraw`: params plus the committed
    /// fully signed state.
    pub fn adjudicator_req(&self) -> Result<AdjudicatorReq, MachineError> {
        let current = self.current.as_ref().ok_or(MachineError::NoCommittedState)?;
        Ok(AdjudicatorReq {
            params: self.params.clone(),
            state: current.state.clone(),
            sigs: current.signatures()?,
        })
    }

    /// The record the controller persists for the current committed state.
    pub fn record(&self) -> Result<StateRecord, MachineError> {
        let current = self.current.as_ref().ok_or(MachineError::NoCommittedState)?;
        Ok(StateRecord {
            phase: self.phase,
            state: current.state.clone(),
            sigs: current.signatures()?,
        })
    }

    fn commit_staged(&mut self) -> Result<(), MachineError> {
        let staged = self.staged.take().ok_or(MachineError::NoStagedState)?;
        if let Some(missing) = staged.sigs.iter().position(Option::is_none) {
            // Leave the staged state in place so the caller can keep
            // collecting signatures.
            let err = MachineError::MissingSignature(missing);
            self.staged = Some(staged);
            return Err(err);
        }
        self.current = Some(staged);
        Ok(())
    }

    fn step(&mut self, from: Phase, to: Phase, op: &'static str) -> Result<(), MachineError> {
        if self.phase != from {
            return Err(MachineError::PhaseViolation {
                op,
                phase: self.phase,
            });
        }
        self.phase = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn two_machines(seed: u64) -> (StateMachine, StateMachine) {
        let mut rng = StdRng::seed_from_u64(seed);
        let alice = Account::new(&mut rng);
        let bob = Account::new(&mut rng);
        let params = Params {
            participants: [alice.address(), bob.address()],
            challenge_duration: 60,
            nonce: rng.gen(),
            app_def: crate::types::Address::default(),
        };
        (
            StateMachine::new(alice, params.clone(), 0).unwrap(),
            StateMachine::new(bob, params, 1).unwrap(),
        )
    }

    fn open(a: &mut StateMachine, b: &mut StateMachine) {
        let alloc = Allocation::single_asset([100.into(), 100.into()]);
        a.init(alloc.clone(), vec![]).unwrap();
        b.init(alloc, vec![]).unwrap();
        let sa = a.sig().unwrap();
        let sb = b.sig().unwrap();
        a.add_sig(1, sb).unwrap();
        b.add_sig(0, sa).unwrap();
        a.enable_init().unwrap();
        b.enable_init().unwrap();
        a.set_funded().unwrap();
        b.set_funded().unwrap();
    }

    #[test]
    fn opening_reaches_acting() {
        let (mut a, mut b) = two_machines(1);
        open(&mut a, &mut b);
        assert_eq!(a.phase(), Phase::Acting);
        assert_eq!(b.phase(), Phase::Acting);
        assert_eq!(a.state().unwrap().version(), 0);
    }

    #[test]
    fn update_round_commits() {
        let (mut a, mut b) = two_machines(2);
        open(&mut a, &mut b);

        let mut next = a.state().unwrap().make_next();
        next.transfer(0, 0, 1, 3.into()).unwrap();

        a.update(next.clone()).unwrap();
        let sa = a.sig().unwrap();

        b.update(next).unwrap();
        b.add_sig(0, sa).unwrap();
        let sb = b.sig().unwrap();
        b.enable().unwrap();

        a.add_sig(1, sb).unwrap();
        a.enable().unwrap();

        assert_eq!(a.phase(), Phase::Acting);
        assert_eq!(a.state().unwrap().version(), 1);
        assert_eq!(a.state().unwrap().allocation().balance(0, 1).unwrap(), 103.into());
    }

    #[test]
    fn discard_rolls_back_to_acting() {
        let (mut a, mut b) = two_machines(3);
        open(&mut a, &mut b);

        let next = a.state().unwrap().make_next();
        a.update(next).unwrap();
        assert_eq!(a.phase(), Phase::Signing);
        a.discard_update().unwrap();
        assert_eq!(a.phase(), Phase::Acting);
        assert_eq!(a.state().unwrap().version(), 0);
    }

    #[test]
    fn enable_requires_all_signatures() {
        let (mut a, mut b) = two_machines(4);
        open(&mut a, &mut b);

        let next = a.state().unwrap().make_next();
        a.update(next).unwrap();
        a.sig().unwrap();
        let err = a.enable().unwrap_err();
        assert!(matches!(err, MachineError::MissingSignature(1)));
        // Still in Signing, the round can continue.
        assert_eq!(a.phase(), Phase::Signing);
    }

    #[test]
    fn add_sig_rejects_wrong_signer() {
        let (mut a, mut b) = two_machines(5);
        let alloc = Allocation::single_asset([1.into(), 1.into()]);
        a.init(alloc.clone(), vec![]).unwrap();
        b.init(alloc, vec![]).unwrap();

        // Bob's signature presented as participant 0.
        let sb = b.sig().unwrap();
        let err = a.add_sig(0, sb).unwrap_err();
        assert!(matches!(err, MachineError::InvalidSignature(0)));
    }

    #[test]
    fn add_sig_rejects_duplicates() {
        let (mut a, mut b) = two_machines(6);
        let alloc = Allocation::single_asset([1.into(), 1.into()]);
        a.init(alloc.clone(), vec![]).unwrap();
        b.init(alloc, vec![]).unwrap();

        let sb = b.sig().unwrap();
        a.add_sig(1, sb).unwrap();
        let err = a.add_sig(1, sb).unwrap_err();
        assert!(matches!(err, MachineError::DuplicateSignature(1)));
    }

    #[test]
    fn sig_is_idempotent() {
        let (mut a, mut b) = two_machines(7);
        let alloc = Allocation::single_asset([1.into(), 1.into()]);
        a.init(alloc.clone(), vec![]).unwrap();
        b.init(alloc, vec![]).unwrap();
        assert_eq!(a.sig().unwrap(), a.sig().unwrap());
    }

    #[test]
    fn illegal_transitions_report_phase_violation() {
        let (mut a, _) = two_machines(8);
        assert!(matches!(
            a.enable(),
            Err(MachineError::PhaseViolation { op: "enable", .. })
        ));
        assert!(matches!(
            a.set_registering(),
            Err(MachineError::PhaseViolation { .. })
        ));
        assert!(matches!(
            a.discard_update(),
            Err(MachineError::PhaseViolation { .. })
        ));
        // Nothing moved.
        assert_eq!(a.phase(), Phase::InitActing);
    }

    #[test]
    fn settlement_chain_is_strict() {
        let (mut a, mut b) = two_machines(9);
        open(&mut a, &mut b);

        let mut fin = a.state().unwrap().make_next();
        fin.finalize();
        a.update(fin.clone()).unwrap();
        b.update(fin).unwrap();
        let sa = a.sig().unwrap();
        let sb = b.sig().unwrap();
        a.add_sig(1, sb).unwrap();
        b.add_sig(0, sa).unwrap();
        a.enable().unwrap();
        b.enable().unwrap();
        assert_eq!(a.phase(), Phase::Final);

        // Skipping set_registering is a violation.
        assert!(matches!(
            a.set_registered(),
            Err(MachineError::PhaseViolation { .. })
        ));
        a.set_registering().unwrap();
        a.set_registered().unwrap();
        a.set_withdrawing().unwrap();
        a.set_withdrawn().unwrap();
        assert_eq!(a.phase(), Phase::Withdrawn);
    }

    #[test]
    fn restore_resumes_from_last_record() {
        let (mut a, mut b) = two_machines(10);
        open(&mut a, &mut b);
        let record = a.record().unwrap();

        let acc = a.acc.clone();
        let params = a.params.clone();
        let restored = StateMachine::restore(acc, params, 0, &[record]).unwrap();
        assert_eq!(restored.phase(), Phase::Acting);
        assert_eq!(restored.state().unwrap().version(), 0);
    }

    #[test]
    fn restore_rejects_empty_log() {
        let (a, _) = two_machines(11);
        let acc = a.acc.clone();
        let params = a.params.clone();
        assert!(matches!(
            StateMachine::restore(acc, params, 0, &[]),
            Err(MachineError::BadRestoreLog)
        ));
    }
}
