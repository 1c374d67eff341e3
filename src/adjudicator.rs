//! Narrow contracts towards the chain: depositing collateral while a
//! channel opens ([`Funder`]) and registering/withdrawing a final state
//! while it closes ([`Adjudicator`], which also covers the settler role).
//!
//! Implementations may talk to a real contract backend or be simulated
//! (see [`crate::sim`]); the controller only sees these traits.

use async_trait::async_trait;
use tokio::time::Instant;

use crate::channel::state::{Allocation, Params, State};
use crate::ctx::{Ctx, CtxError};
use crate::types::{PartIdx, Signature, PARTICIPANTS};

/// Params plus the fully signed state to register or withdraw with.
#[derive(Debug, Clone)]
pub struct AdjudicatorReq {
    pub params: Params,
    pub state: State,
    pub sigs: [Signature; PARTICIPANTS],
}

/// Outcome of a successful `register` call.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    /// The version the adjudicator now holds. The controller asserts this
    /// equals the local final version.
    pub version: u64,
    /// If set and in the future, withdrawal only succeeds after this
    /// instant.
    pub withdrawal_timeout: Option<Instant>,
}

/// Deposit request for our share of the collateral.
#[derive(Debug, Clone)]
pub struct FundingReq {
    pub params: Params,
    pub idx: PartIdx,
    pub allocation: Allocation,
}

/// Funding failed because counterparties did not deposit in time. Which
/// ones carries through every wrapping layer, so callers can decide whom
/// to blame.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("asset {asset}: participants {timed_out:?} did not deposit in time")]
pub struct AssetFundingError {
    pub asset: usize,
    pub timed_out: Vec<PartIdx>,
}

#[derive(Debug, thiserror::Error)]
pub enum FundingError {
    // Not `transparent`: the payload must stay its own node in the cause
    // chain so `asset_funding_error` can find it by downcast.
    #[error("collateral deposits incomplete")]
    AssetFunding(#[from] AssetFundingError),
    #[error("funding aborted")]
    Ctx(#[from] CtxError),
    #[error("funder backend: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AdjudicatorError {
    #[error("adjudicator call aborted")]
    Ctx(#[from] CtxError),
    #[error("adjudicator backend: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Funder: Send + Sync {
    /// Deposits our collateral and waits until every participant has
    /// deposited, or until `ctx` expires, in which case the missing
    /// participants are reported via [`AssetFundingError`].
    async fn fund(&self, ctx: &Ctx, req: FundingReq) -> Result<(), FundingError>;
}

#[async_trait]
pub trait Adjudicator: Send + Sync {
    async fn register(
        &self,
        ctx: &Ctx,
        req: &AdjudicatorReq,
    ) -> Result<Registration, AdjudicatorError>;

    async fn withdraw(&self, ctx: &Ctx, req: &AdjudicatorReq) -> Result<(), AdjudicatorError>;
}

/// Finds an [`AssetFundingError`] anywhere in `err`'s cause chain.
pub fn asset_funding_error<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a AssetFundingError> {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(afe) = e.downcast_ref::<AssetFundingError>() {
            return Some(afe);
        }
        cur = e.source();
    }
    None
}

/// Whether `err` was ultimately caused by a funding timeout, however
/// deeply wrapped.
pub fn is_asset_funding_error(err: &(dyn std::error::Error + 'static)) -> bool {
    asset_funding_error(err).is_some()
}
