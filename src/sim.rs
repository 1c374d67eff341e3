//! Simulated chain backends: an in-memory asset holder with a funder and
//! adjudicator on top. Used by the demo and the end-to-end tests; the
//! interfaces are the same ones a contract-backed implementation fills.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::adjudicator::{
    Adjudicator, AdjudicatorError, AdjudicatorReq, AssetFundingError, Funder, FundingError,
    FundingReq, Registration,
};
use crate::ctx::{Ctx, CtxError};
use crate::sig;
use crate::types::{Address, ChannelId, PartIdx, U256, PARTICIPANTS};

#[derive(Default)]
struct BankInner {
    /// `deposits[channel][asset][participant]`
    deposits: HashMap<ChannelId, Vec<[bool; PARTICIPANTS]>>,
    registered: HashMap<ChannelId, u64>,
    withdrawn: HashMap<ChannelId, bool>,
    payouts: HashMap<Address, U256>,
}

/// The shared in-memory asset holder.
pub struct SimBank {
    inner: StdMutex<BankInner>,
    changed: Notify,
}

impl SimBank {
    pub fn new() -> Self {
        SimBank {
            inner: StdMutex::new(BankInner::default()),
            changed: Notify::new(),
        }
    }

    fn deposit(&self, channel: ChannelId, num_assets: usize, part: PartIdx) {
        {
            let mut inner = self.inner.lock().expect("bank lock poisoned");
            let deposits = inner
                .deposits
                .entry(channel)
                .or_insert_with(|| vec![[false; PARTICIPANTS]; num_assets]);
            for asset in deposits.iter_mut() {
                asset[part] = true;
            }
        }
        self.changed.notify_waiters();
    }

    /// Per asset, the participants that have not deposited yet.
    fn missing(&self, channel: ChannelId, num_assets: usize) -> Vec<(usize, Vec<PartIdx>)> {
        let inner = self.inner.lock().expect("bank lock poisoned");
        let deposits = inner.deposits.get(&channel);
        (0..num_assets)
            .filter_map(|asset| {
                let missing: Vec<PartIdx> = (0..PARTICIPANTS)
                    .filter(|&part| {
                        deposits
                            .and_then(|d| d.get(asset))
                            .map_or(true, |parts| !parts[part])
                    })
                    .collect();
                if missing.is_empty() {
                    None
                } else {
                    Some((asset, missing))
                }
            })
            .collect()
    }

    fn register(&self, channel: ChannelId, version: u64) {
        let mut inner = self.inner.lock().expect("bank lock poisoned");
        let entry = inner.registered.entry(channel).or_insert(version);
        if *entry < version {
            *entry = version;
        }
    }

    fn registered_version(&self, channel: ChannelId) -> Option<u64> {
        self.inner
            .lock()
            .expect("bank lock poisoned")
            .registered
            .get(&channel)
            .copied()
    }

    fn pay_out(&self, req: &AdjudicatorReq) -> Result<(), String> {
        let channel = req.state.channel_id();
        let mut inner = self.inner.lock().expect("bank lock poisoned");
        if !inner.registered.contains_key(&channel) {
            return Err("withdraw before register".into());
        }
        if inner.withdrawn.get(&channel).copied().unwrap_or(false) {
            // Idempotent; the funds were already released.
            return Ok(());
        }
        for (part, &addr) in req.params.participants.iter().enumerate() {
            let mut sum = U256::zero();
            for asset in 0..req.state.allocation().num_assets() {
                sum = sum.saturating_add(
                    req.state
                        .allocation()
                        .balance(asset, part)
                        .map_err(|e| e.to_string())?,
                );
            }
            let payout = inner.payouts.entry(addr).or_insert_with(U256::zero);
            *payout = payout.saturating_add(sum);
        }
        inner.withdrawn.insert(channel, true);
        Ok(())
    }

    /// Total funds paid out to `addr` across all settled channels.
    pub fn payout(&self, addr: Address) -> U256 {
        self.inner
            .lock()
            .expect("bank lock poisoned")
            .payouts
            .get(&addr)
            .copied()
            .unwrap_or_else(U256::zero)
    }
}

impl Default for SimBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Funder against the [`SimBank`]. A withholding funder never deposits,
/// which is how tests model a counterparty that fails to fund.
pub struct SimFunder {
    bank: Arc<SimBank>,
    withhold: bool,
}

impl SimFunder {
    pub fn new(bank: Arc<SimBank>) -> Self {
        SimFunder {
            bank,
            withhold: false,
        }
    }

    pub fn withholding(bank: Arc<SimBank>) -> Self {
        SimFunder {
            bank,
            withhold: true,
        }
    }
}

#[async_trait]
impl Funder for SimFunder {
    async fn fund(&self, ctx: &Ctx, req: FundingReq) -> Result<(), FundingError> {
        let channel = req
            .params
            .id()
            .map_err(|e| FundingError::Backend(e.to_string()))?;
        let num_assets = req.allocation.num_assets();

        if !self.withhold {
            self.bank.deposit(channel, num_assets, req.idx);
        }

        loop {
            // Arm the notification before checking, so a deposit landing
            // in between is not lost.
            let notified = self.bank.changed.notified();
            let missing = self.bank.missing(channel, num_assets);
            if missing.is_empty() {
                return Ok(());
            }
            match ctx.run(notified).await {
                Ok(()) => continue,
                Err(CtxError::DeadlineExceeded) => {
                    if let Some((asset, timed_out)) = missing.into_iter().next() {
                        return Err(AssetFundingError { asset, timed_out }.into());
                    }
                    return Ok(());
                }
                Err(e @ CtxError::Cancelled) => return Err(e.into()),
            }
        }
    }
}

/// Adjudicator against the [`SimBank`]. Verifies the signatures the way
/// the on-chain contract would before accepting a registration.
pub struct SimAdjudicator {
    bank: Arc<SimBank>,
    /// Optional artificial challenge window reported back on register.
    hold: Option<Duration>,
}

impl SimAdjudicator {
    pub fn new(bank: Arc<SimBank>) -> Self {
        SimAdjudicator { bank, hold: None }
    }

    /// Reports a withdrawal timeout `hold` in the future on every
    /// registration.
    pub fn with_hold(bank: Arc<SimBank>, hold: Duration) -> Self {
        SimAdjudicator {
            bank,
            hold: Some(hold),
        }
    }

    fn verify(req: &AdjudicatorReq) -> Result<(), AdjudicatorError> {
        let hash = req
            .state
            .hash()
            .map_err(|e| AdjudicatorError::Backend(e.to_string()))?;
        for (part, sig) in req.sigs.iter().enumerate() {
            let signer = sig::recover_signer(hash, *sig)
                .map_err(|e| AdjudicatorError::Backend(e.to_string()))?;
            if signer != req.params.participants[part] {
                return Err(AdjudicatorError::Backend(format!(
                    "signature {part} does not match participant"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Adjudicator for SimAdjudicator {
    async fn register(
        &self,
        ctx: &Ctx,
        req: &AdjudicatorReq,
    ) -> Result<Registration, AdjudicatorError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        Self::verify(req)?;
        let channel = req.state.channel_id();
        self.bank.register(channel, req.state.version());
        let version = self
            .bank
            .registered_version(channel)
            .unwrap_or_else(|| req.state.version());
        Ok(Registration {
            version,
            withdrawal_timeout: self.hold.map(|d| Instant::now() + d),
        })
    }

    async fn withdraw(&self, ctx: &Ctx, req: &AdjudicatorReq) -> Result<(), AdjudicatorError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        Self::verify(req)?;
        self.bank.pay_out(req).map_err(AdjudicatorError::Backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjudicator::is_asset_funding_error;
    use crate::channel::state::{Allocation, Params, State};
    use crate::sig::Account;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn funded_req(rng: &mut StdRng) -> (AdjudicatorReq, Account, Account) {
        let alice = Account::new(rng);
        let bob = Account::new(rng);
        let params = Params {
            participants: [alice.address(), bob.address()],
            challenge_duration: 60,
            nonce: rng.gen(),
            app_def: Address::default(),
        };
        let state = State::initial(
            params.id().unwrap(),
            Allocation::single_asset([70.into(), 30.into()]),
            vec![],
        );
        let hash = state.hash().unwrap();
        let sigs = [alice.sign(hash).unwrap(), bob.sign(hash).unwrap()];
        (
            AdjudicatorReq { params, state, sigs },
            alice,
            bob,
        )
    }

    #[tokio::test]
    async fn fund_completes_when_both_deposit() {
        let mut rng = StdRng::seed_from_u64(0);
        let bank = Arc::new(SimBank::new());
        let (req, ..) = funded_req(&mut rng);
        let fund_req = |idx| FundingReq {
            params: req.params.clone(),
            idx,
            allocation: req.state.allocation().clone(),
        };

        let f0 = SimFunder::new(bank.clone());
        let f1 = SimFunder::new(bank.clone());
        let ctx = Ctx::background().with_timeout(Duration::from_secs(5));
        let (a, b) = tokio::join!(f0.fund(&ctx, fund_req(0)), f1.fund(&ctx, fund_req(1)));
        a.unwrap();
        b.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn withholding_peer_is_reported() {
        let mut rng = StdRng::seed_from_u64(1);
        let bank = Arc::new(SimBank::new());
        let (req, ..) = funded_req(&mut rng);

        let funder = SimFunder::new(bank);
        let ctx = Ctx::background().with_timeout(Duration::from_millis(100));
        let err = funder
            .fund(
                &ctx,
                FundingReq {
                    params: req.params.clone(),
                    idx: 0,
                    allocation: req.state.allocation().clone(),
                },
            )
            .await
            .unwrap_err();

        assert!(is_asset_funding_error(&err));
        match err {
            FundingError::AssetFunding(afe) => {
                assert_eq!(afe.asset, 0);
                assert_eq!(afe.timed_out, vec![1]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_then_withdraw_pays_out() {
        let mut rng = StdRng::seed_from_u64(2);
        let bank = Arc::new(SimBank::new());
        let (req, alice, bob) = funded_req(&mut rng);

        let adj = SimAdjudicator::new(bank.clone());
        let ctx = Ctx::background();
        let reg = adj.register(&ctx, &req).await.unwrap();
        assert_eq!(reg.version, 0);
        assert!(reg.withdrawal_timeout.is_none());

        adj.withdraw(&ctx, &req).await.unwrap();
        assert_eq!(bank.payout(alice.address()), 70.into());
        assert_eq!(bank.payout(bob.address()), 30.into());

        // Withdrawing twice does not double-pay.
        adj.withdraw(&ctx, &req).await.unwrap();
        assert_eq!(bank.payout(alice.address()), 70.into());
    }

    #[tokio::test]
    async fn register_rejects_bad_signatures() {
        let mut rng = StdRng::seed_from_u64(3);
        let bank = Arc::new(SimBank::new());
        let (mut req, ..) = funded_req(&mut rng);
        req.sigs[1] = rng.gen();

        let adj = SimAdjudicator::new(bank);
        let err = adj.register(&Ctx::background(), &req).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn withdraw_requires_registration() {
        let mut rng = StdRng::seed_from_u64(4);
        let bank = Arc::new(SimBank::new());
        let (req, ..) = funded_req(&mut rng);

        let adj = SimAdjudicator::new(bank);
        assert!(adj.withdraw(&Ctx::background(), &req).await.is_err());
    }
}
