//! Channel parameters, allocations and states: pure data with deterministic
//! hashing, plus the transition validity check every update goes through.

use serde::Serialize;

use crate::codec::{self, EncodeError};
use crate::types::{Address, ChannelId, Hash, PartIdx, U256, PARTICIPANTS};

/// Immutable channel configuration, fixed at proposal acceptance. Hashing
/// the canonical encoding yields the channel id, so both peers must agree
/// on every field bit for bit.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Params {
    /// Ordered; a participant's position is their index everywhere.
    pub participants: [Address; PARTICIPANTS],
    /// Seconds the adjudicator grants for counter-registration.
    pub challenge_duration: u64,
    /// Proposer-chosen randomness making the channel id unique.
    pub nonce: U256,
    /// Identifies the application governing `app_data`. The payment
    /// application uses the zero sentinel.
    pub app_def: Address,
}

impl Params {
    pub fn id(&self) -> Result<ChannelId, EncodeError> {
        codec::to_hash(self)
    }

    pub fn index_of(&self, addr: Address) -> Option<PartIdx> {
        self.participants.iter().position(|&p| p == addr)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("allocation underflow: asset {asset}, participant {from}")]
    Underflow { asset: usize, from: PartIdx },
    #[error("balance overflow: asset {asset}, participant {to}")]
    Overflow { asset: usize, to: PartIdx },
    #[error("asset index {0} out of range")]
    UnknownAsset(usize),
    #[error("participant index {0} out of range")]
    UnknownParticipant(PartIdx),
    #[error("asset {asset} allocates {got} balances, expected {expected}")]
    Malformed {
        asset: usize,
        got: usize,
        expected: usize,
    },
    #[error("allocation has no assets")]
    Empty,
}

/// Per-asset, per-participant balances. The total per asset is the on-chain
/// collateral; off-chain updates only ever move it between participants.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct Allocation {
    balances: Vec<Vec<U256>>,
}

impl Allocation {
    pub fn new(balances: Vec<Vec<U256>>) -> Result<Self, AllocationError> {
        if balances.is_empty() {
            return Err(AllocationError::Empty);
        }
        for (asset, bals) in balances.iter().enumerate() {
            if bals.len() != PARTICIPANTS {
                return Err(AllocationError::Malformed {
                    asset,
                    got: bals.len(),
                    expected: PARTICIPANTS,
                });
            }
        }
        Ok(Allocation { balances })
    }

    /// Single-asset allocation, the payment-application case.
    pub fn single_asset(balances: [U256; PARTICIPANTS]) -> Self {
        Allocation {
            balances: vec![balances.to_vec()],
        }
    }

    pub fn num_assets(&self) -> usize {
        self.balances.len()
    }

    pub fn balance(&self, asset: usize, part: PartIdx) -> Result<U256, AllocationError> {
        self.balances
            .get(asset)
            .ok_or(AllocationError::UnknownAsset(asset))?
            .get(part)
            .copied()
            .ok_or(AllocationError::UnknownParticipant(part))
    }

    /// Sum over participants, per asset. Constant across valid transitions.
    pub fn totals(&self) -> Vec<U256> {
        self.balances
            .iter()
            .map(|bals| {
                bals.iter()
                    .fold(U256::zero(), |acc, b| acc.saturating_add(*b))
            })
            .collect()
    }

    /// Moves `amount` of `asset` between participants. Never drives a
    /// balance negative.
    pub fn transfer(
        &mut self,
        asset: usize,
        from: PartIdx,
        to: PartIdx,
        amount: U256,
    ) -> Result<(), AllocationError> {
        let debited = self
            .balance(asset, from)?
            .checked_sub(amount)
            .ok_or(AllocationError::Underflow { asset, from })?;
        let credited = self
            .balance(asset, to)?
            .checked_add(amount)
            .ok_or(AllocationError::Overflow { asset, to })?;
        self.balances[asset][from] = debited;
        self.balances[asset][to] = credited;
        Ok(())
    }
}

/// A versioned snapshot of the channel's funds. Only fully signed states
/// matter; signatures live next to the state in the machine.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct State {
    channel_id: ChannelId,
    version: u64,
    allocation: Allocation,
    app_data: Vec<u8>,
    is_final: bool,
}

impl State {
    /// The version-0 state a channel starts from.
    pub fn initial(channel_id: ChannelId, allocation: Allocation, app_data: Vec<u8>) -> Self {
        State {
            channel_id,
            version: 0,
            allocation,
            app_data,
            is_final: false,
        }
    }

    pub(crate) fn from_parts(
        channel_id: ChannelId,
        version: u64,
        allocation: Allocation,
        app_data: Vec<u8>,
        is_final: bool,
    ) -> Self {
        State {
            channel_id,
            version,
            allocation,
            app_data,
            is_final,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn app_data(&self) -> &[u8] {
        &self.app_data
    }

    pub fn hash(&self) -> Result<Hash, EncodeError> {
        codec::to_hash(self)
    }

    /// Clone with the version bumped, the starting point of every update.
    pub fn make_next(&self) -> State {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    pub fn transfer(
        &mut self,
        asset: usize,
        from: PartIdx,
        to: PartIdx,
        amount: U256,
    ) -> Result<(), AllocationError> {
        self.allocation.transfer(asset, from, to, amount)
    }

    /// Marks the state final; no further off-chain updates are legal on top
    /// of it.
    pub fn finalize(&mut self) {
        self.is_final = true;
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("version regression: expected {expected}, got {got}")]
    VersionRegression { expected: u64, got: u64 },
    #[error("asset totals differ between old and new state")]
    AssetTotalMismatch,
    #[error("channel is finalized, no further updates are legal")]
    FinalizedChannel,
    #[error("new state belongs to a different channel")]
    ChannelIdMismatch,
}

/// Gate every update goes through: versions strictly increase by one, asset
/// totals are preserved, final states are terminal.
pub fn validate_transition(old: &State, new: &State) -> Result<(), TransitionError> {
    if old.is_final {
        return Err(TransitionError::FinalizedChannel);
    }
    if new.channel_id != old.channel_id {
        return Err(TransitionError::ChannelIdMismatch);
    }
    if new.version != old.version + 1 {
        return Err(TransitionError::VersionRegression {
            expected: old.version + 1,
            got: new.version,
        });
    }
    if old.allocation.totals() != new.allocation.totals() {
        return Err(TransitionError::AssetTotalMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn test_params(rng: &mut StdRng) -> Params {
        Params {
            participants: [rng.gen(), rng.gen()],
            challenge_duration: 60,
            nonce: rng.gen(),
            app_def: Address::default(),
        }
    }

    #[test]
    fn channel_id_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(0x1337);
        let params = test_params(&mut rng);
        assert_eq!(params.id().unwrap(), params.clone().id().unwrap());

        let mut other = params.clone();
        other.nonce = rng.gen();
        assert_ne!(params.id().unwrap(), other.id().unwrap());
    }

    #[test]
    fn transfer_moves_funds() {
        let mut alloc = Allocation::single_asset([100.into(), 100.into()]);
        alloc.transfer(0, 0, 1, 30.into()).unwrap();
        assert_eq!(alloc.balance(0, 0).unwrap(), 70.into());
        assert_eq!(alloc.balance(0, 1).unwrap(), 130.into());
        assert_eq!(alloc.totals(), vec![200.into()]);
    }

    #[test]
    fn transfer_rejects_underflow() {
        let mut alloc = Allocation::single_asset([10.into(), 0.into()]);
        let err = alloc.transfer(0, 0, 1, 11.into()).unwrap_err();
        assert_eq!(err, AllocationError::Underflow { asset: 0, from: 0 });
        // Balances untouched on failure.
        assert_eq!(alloc.balance(0, 0).unwrap(), 10.into());
    }

    #[test]
    fn malformed_allocation_rejected() {
        assert!(matches!(
            Allocation::new(vec![vec![1.into()]]),
            Err(AllocationError::Malformed { .. })
        ));
        assert_eq!(Allocation::new(vec![]), Err(AllocationError::Empty));
    }

    fn state_pair() -> (State, State) {
        let mut rng = StdRng::seed_from_u64(7);
        let id: ChannelId = rng.gen();
        let old = State::initial(id, Allocation::single_asset([50.into(), 50.into()]), vec![]);
        let new = old.make_next();
        (old, new)
    }

    #[test]
    fn valid_transition_passes() {
        let (old, mut new) = state_pair();
        new.transfer(0, 0, 1, 5.into()).unwrap();
        validate_transition(&old, &new).unwrap();
    }

    #[test]
    fn version_must_increase_by_one() {
        let (old, mut new) = state_pair();
        new.version = old.version();
        assert_eq!(
            validate_transition(&old, &new),
            Err(TransitionError::VersionRegression {
                expected: 1,
                got: 0
            })
        );
    }

    #[test]
    fn totals_must_match() {
        let (old, new) = state_pair();
        let richer = State::from_parts(
            new.channel_id(),
            1,
            Allocation::single_asset([50.into(), 51.into()]),
            vec![],
            false,
        );
        assert_eq!(
            validate_transition(&old, &richer),
            Err(TransitionError::AssetTotalMismatch)
        );
    }

    #[test]
    fn final_states_are_terminal() {
        let (mut old, new) = state_pair();
        old.finalize();
        assert_eq!(
            validate_transition(&old, &new),
            Err(TransitionError::FinalizedChannel)
        );
    }

    #[test]
    fn foreign_channel_rejected() {
        let (old, new) = state_pair();
        let foreign = State::from_parts(
            ChannelId::default(),
            1,
            new.allocation().clone(),
            vec![],
            false,
        );
        assert_eq!(
            validate_transition(&old, &foreign),
            Err(TransitionError::ChannelIdMismatch)
        );
    }

    #[test]
    fn state_hash_stable_and_version_sensitive() {
        let (old, new) = state_pair();
        assert_eq!(old.hash().unwrap(), old.clone().hash().unwrap());
        assert_ne!(old.hash().unwrap(), new.hash().unwrap());
    }
}
