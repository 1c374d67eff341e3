//! The top-level client: local identity, peer registry, channel map, and
//! the proposal protocol in both directions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::adjudicator::{Adjudicator, Funder};
use crate::channel::machine::MachineError;
use crate::channel::state::{Allocation, Params};
use crate::channel::{Channel, ChannelError, UpdateHandler};
use crate::codec::EncodeError;
use crate::ctx::{CancelHandle, Ctx, CtxError};
use crate::peer::{Dialer, Listener, Peer, PeerError, Registry};
use crate::persist::{PersistError, Persister};
use crate::sig::Account;
use crate::types::{Address, ChannelId, SessionId, U256, PARTICIPANTS};
use crate::wire::{self, Interest, Message, ProposalAcc, ProposalRej, ProposalReq};

/// How long an accepted connection may take to announce its identity.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid proposal: {0}")]
    InvalidProposal(&'static str),
    #[error("proposal rejected: {reason}")]
    ProposalRejected { reason: String },
    #[error("proposal timed out")]
    ProposalTimedOut,
    #[error("peer violated the protocol: {0}")]
    ProtocolViolation(String),
    #[error("no persister configured")]
    NoPersister,
    #[error("unknown channel {0:?}")]
    UnknownChannel(ChannelId),
    #[error("opening channel failed")]
    Channel(#[from] ChannelError),
    #[error("connection failure")]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Ctx(#[from] CtxError),
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("persistence failure")]
    Persist(#[from] PersistError),
}

/// A channel proposal as the local application states it; the wire request
/// is derived from this.
#[derive(Debug, Clone)]
pub struct ChannelProposal {
    pub challenge_duration: u64,
    pub nonce: U256,
    pub app_def: Address,
    pub init_data: Vec<u8>,
    pub init_allocation: Allocation,
    /// Wire identities; `peers[0]` must be the proposing client.
    pub peers: [Address; PARTICIPANTS],
}

/// An inbound proposal that passed validation, as shown to the
/// [`ProposalHandler`].
#[derive(Debug, Clone)]
pub struct ProposalNotice {
    pub session_id: SessionId,
    pub req: ProposalReq,
}

/// Application hook deciding inbound channel proposals.
///
/// The responder is consumed by [`ProposalResponder::accept`] or
/// [`ProposalResponder::reject`]; calling a second one is unrepresentable.
#[async_trait]
pub trait ProposalHandler: Send + Sync {
    async fn handle(&self, notice: ProposalNotice, responder: ProposalResponder);
}

pub struct Client {
    acc: Account,
    addr: Address,
    registry: Arc<Registry>,
    channels: StdRwLock<HashMap<ChannelId, Channel>>,
    funder: Arc<dyn Funder>,
    adjudicator: Arc<dyn Adjudicator>,
    persister: Option<Arc<dyn Persister>>,
    proposal_handler: Arc<dyn ProposalHandler>,
    update_handler: Arc<dyn UpdateHandler>,
    /// Lives as long as the client; cancelling it stops every background
    /// task.
    lifetime: Ctx,
    shutdown: CancelHandle,
}

impl core::fmt::Debug for Client {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Client").field("addr", &self.addr).finish()
    }
}

impl Client {
    /// Creates a client and starts its peer dispatcher. The dialer is used
    /// for lazy outbound connections; inbound ones arrive via [`listen`].
    ///
    /// [`listen`]: Client::listen
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        acc: Account,
        dialer: Arc<dyn Dialer>,
        proposal_handler: Arc<dyn ProposalHandler>,
        update_handler: Arc<dyn UpdateHandler>,
        funder: Arc<dyn Funder>,
        adjudicator: Arc<dyn Adjudicator>,
        persister: Option<Arc<dyn Persister>>,
    ) -> Arc<Client> {
        let addr = acc.address();
        let (registry, peer_events) = Registry::new(addr, dialer);
        let (lifetime, shutdown) = Ctx::background().with_cancel();
        let client = Arc::new(Client {
            acc,
            addr,
            registry,
            channels: StdRwLock::new(HashMap::new()),
            funder,
            adjudicator,
            persister,
            proposal_handler,
            update_handler,
            lifetime,
            shutdown,
        });
        tokio::spawn(dispatch_peers(client.clone(), peer_events));
        client
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// The channel controller for `id`, if open.
    pub fn channel(&self, id: ChannelId) -> Result<Channel, ClientError> {
        self.channels
            .read()
            .expect("channel map poisoned")
            .get(&id)
            .cloned()
            .ok_or(ClientError::UnknownChannel(id))
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels
            .read()
            .expect("channel map poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Accepts inbound connections until the listener fails or the client
    /// closes. Each accepted connection must announce itself with `Hello`
    /// before it is registered.
    pub async fn listen<L: Listener>(&self, mut listener: L) {
        loop {
            let conn = tokio::select! {
                conn = listener.accept() => conn,
                _ = self.lifetime.done() => return,
            };
            let mut conn = match conn {
                Ok(conn) => conn,
                Err(error) => {
                    tracing::warn!(%error, "accept failed, listener stopping");
                    return;
                }
            };
            let registry = self.registry.clone();
            let ctx = self.lifetime.with_timeout(HANDSHAKE_TIMEOUT);
            tokio::spawn(async move {
                let frame = match ctx.run(wire::read_frame(&mut conn)).await {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(error)) => {
                        tracing::debug!(%error, "dropping connection before handshake");
                        return;
                    }
                    Err(_) => {
                        tracing::debug!("connection did not identify in time");
                        return;
                    }
                };
                match Message::decode(&frame) {
                    Ok(Message::Hello(hello)) => {
                        registry.register_incoming(hello.sender, conn).await;
                    }
                    Ok(other) => {
                        tracing::debug!(msg = other.name(), "expected hello, dropping connection");
                    }
                    Err(error) => {
                        tracing::debug!(%error, "malformed handshake, dropping connection");
                    }
                }
            });
        }
    }

    /// Establishes (or reuses) the connection to `addr`. Channels dial
    /// lazily anyway; this exists for callers that want connection errors
    /// early.
    pub async fn connect_peer(&self, ctx: &Ctx, addr: Address) -> Result<(), ClientError> {
        self.registry.get(ctx, addr).await?;
        Ok(())
    }

    /// Proposes a channel to `prop.peers[1]` and, on acceptance, runs the
    /// opening protocol including funding.
    pub async fn propose_channel(
        &self,
        ctx: &Ctx,
        prop: ChannelProposal,
    ) -> Result<Channel, ClientError> {
        self.validate_proposal(&prop)?;

        let req = ProposalReq {
            challenge_duration: prop.challenge_duration,
            nonce: prop.nonce,
            participant: self.addr,
            app_def: prop.app_def,
            init_data: prop.init_data.clone(),
            init_allocation: prop.init_allocation.clone(),
            peers: prop.peers,
        };
        let session = req.session_id()?;

        let peer = self.registry.get(ctx, prop.peers[1]).await?;
        let mut sub = peer.subscribe(Interest::ProposalResponses { session })?;
        peer.send(ctx, &Message::ProposalReq(req)).await?;

        // Replies with a foreign session id are dropped by the filter, so
        // a tampering responder shows up as a timeout here, not an oracle.
        let acc = match sub.recv(ctx).await {
            Ok(Message::ProposalAcc(acc)) => acc,
            Ok(Message::ProposalRej(rej)) => {
                return Err(ClientError::ProposalRejected { reason: rej.reason });
            }
            Ok(other) => {
                return Err(ClientError::ProtocolViolation(format!(
                    "unexpected {} as proposal response",
                    other.name()
                )));
            }
            Err(PeerError::Ctx(CtxError::DeadlineExceeded)) => {
                return Err(ClientError::ProposalTimedOut);
            }
            Err(e) => return Err(e.into()),
        };
        drop(sub);

        let params = Params {
            participants: [self.addr, acc.participant],
            challenge_duration: prop.challenge_duration,
            nonce: prop.nonce,
            app_def: prop.app_def,
        };
        self.open_channel(ctx, params, 0, peer, prop.init_allocation, prop.init_data)
            .await
    }

    /// Reconnects and resumes a persisted channel in its last recorded
    /// phase.
    pub async fn restore_channel(
        &self,
        ctx: &Ctx,
        params: Params,
        idx: crate::types::PartIdx,
        peer_addr: Address,
    ) -> Result<Channel, ClientError> {
        let persister = self.persister.clone().ok_or(ClientError::NoPersister)?;
        let peer = self.registry.get(ctx, peer_addr).await?;
        let channel = Channel::restore(
            self.acc.clone(),
            params,
            idx,
            peer,
            self.funder.clone(),
            self.adjudicator.clone(),
            persister,
            self.update_handler.clone(),
        )?;
        self.insert_channel(&channel);
        Ok(channel)
    }

    /// Closes all channels and connections; background tasks stop.
    pub async fn close(&self) {
        self.shutdown.cancel();
        for channel in self.channels() {
            channel.close();
        }
        self.channels
            .write()
            .expect("channel map poisoned")
            .clear();
        self.registry.close().await;
    }

    fn validate_proposal(&self, prop: &ChannelProposal) -> Result<(), ClientError> {
        if prop.challenge_duration == 0 {
            return Err(ClientError::InvalidProposal(
                "challenge duration must be positive",
            ));
        }
        if prop.peers[0] != self.addr {
            return Err(ClientError::InvalidProposal(
                "peers[0] must be the proposing client",
            ));
        }
        if prop.peers[0] == prop.peers[1] {
            return Err(ClientError::InvalidProposal(
                "cannot open a channel with ourselves",
            ));
        }
        Ok(())
    }

    async fn open_channel(
        &self,
        ctx: &Ctx,
        params: Params,
        idx: crate::types::PartIdx,
        peer: Arc<Peer>,
        allocation: Allocation,
        app_data: Vec<u8>,
    ) -> Result<Channel, ClientError> {
        let channel = Channel::new(
            self.acc.clone(),
            params,
            idx,
            peer,
            self.funder.clone(),
            self.adjudicator.clone(),
            self.persister.clone(),
            self.update_handler.clone(),
        )?;
        self.insert_channel(&channel);
        if let Err(e) = channel.open(ctx, allocation, app_data).await {
            self.remove_channel(channel.id());
            channel.close();
            return Err(e.into());
        }
        Ok(channel)
    }

    fn insert_channel(&self, channel: &Channel) {
        self.channels
            .write()
            .expect("channel map poisoned")
            .insert(channel.id(), channel.clone());
    }

    fn remove_channel(&self, id: ChannelId) {
        self.channels
            .write()
            .expect("channel map poisoned")
            .remove(&id);
    }
}

/// Attaches a proposal loop to every peer that comes to life.
async fn dispatch_peers(client: Arc<Client>, mut peers: mpsc::UnboundedReceiver<Arc<Peer>>) {
    loop {
        let peer = tokio::select! {
            peer = peers.recv() => match peer {
                Some(peer) => peer,
                None => return,
            },
            _ = client.lifetime.done() => return,
        };
        tokio::spawn(peer_proposal_loop(client.clone(), peer));
    }
}

/// Receives proposal requests from one peer and dispatches each to the
/// application handler.
async fn peer_proposal_loop(client: Arc<Client>, peer: Arc<Peer>) {
    let mut sub = match peer.subscribe(Interest::ProposalReqs) {
        Ok(sub) => sub,
        Err(_) => return,
    };
    loop {
        let req = match sub.recv(&client.lifetime).await {
            Ok(Message::ProposalReq(req)) => req,
            Ok(_) => continue,
            Err(_) => return,
        };

        // Invalid requests are dropped without involving the application;
        // the proposer learns via its own timeout.
        if req.challenge_duration == 0 {
            tracing::debug!(peer = ?peer.remote(), "dropping proposal with zero challenge duration");
            continue;
        }
        if req.peers[1] != client.addr {
            tracing::debug!(peer = ?peer.remote(), "dropping proposal not addressed to us");
            continue;
        }
        if req.peers[0] != peer.remote() {
            tracing::debug!(peer = ?peer.remote(), "dropping proposal with forged sender");
            continue;
        }
        let session_id = match req.session_id() {
            Ok(session) => session,
            Err(error) => {
                tracing::debug!(%error, "dropping unencodable proposal");
                continue;
            }
        };

        let notice = ProposalNotice {
            session_id,
            req: req.clone(),
        };
        let responder = ProposalResponder {
            client: client.clone(),
            peer: peer.clone(),
            session: session_id,
            req,
        };
        let handler = client.proposal_handler.clone();
        // The handler may run the whole opening protocol; keep receiving
        // further proposals meanwhile.
        tokio::spawn(async move {
            handler.handle(notice, responder).await;
        });
    }
}

/// Responder for one inbound proposal; consumed by the decision.
pub struct ProposalResponder {
    client: Arc<Client>,
    peer: Arc<Peer>,
    session: SessionId,
    req: ProposalReq,
}

impl ProposalResponder {
    /// Accepts the proposal with `acc` as our participant account, runs
    /// the opening protocol as index 1 and returns the open channel.
    pub async fn accept(self, ctx: &Ctx, acc: Account) -> Result<Channel, ClientError> {
        let msg = Message::ProposalAcc(ProposalAcc {
            session_id: self.session,
            participant: acc.address(),
        });
        self.peer.send(ctx, &msg).await?;

        let params = Params {
            participants: [self.req.participant, acc.address()],
            challenge_duration: self.req.challenge_duration,
            nonce: self.req.nonce,
            app_def: self.req.app_def,
        };
        let channel = Channel::new(
            acc,
            params,
            1,
            self.peer.clone(),
            self.client.funder.clone(),
            self.client.adjudicator.clone(),
            self.client.persister.clone(),
            self.client.update_handler.clone(),
        )?;
        self.client.insert_channel(&channel);
        if let Err(e) = channel
            .open(ctx, self.req.init_allocation.clone(), self.req.init_data.clone())
            .await
        {
            self.client.remove_channel(channel.id());
            channel.close();
            return Err(e.into());
        }
        Ok(channel)
    }

    /// Rejects the proposal with a reason for the proposer.
    pub async fn reject(self, ctx: &Ctx, reason: &str) -> Result<(), ClientError> {
        let msg = Message::ProposalRej(ProposalRej {
            session_id: self.session,
            reason: wire::clamp_reason(reason),
        });
        self.peer.send(ctx, &msg).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Conn;
    use crate::sim::{SimAdjudicator, SimBank, SimFunder};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::io;

    /// Dialer that fails the test if used; locally invalid proposals must
    /// be rejected before any network activity.
    struct DoNotDialDialer;

    #[async_trait]
    impl Dialer for DoNotDialDialer {
        async fn dial(&self, _: &Ctx, _: Address) -> io::Result<Conn> {
            panic!("the dialer must not be called");
        }
    }

    struct NopProposals;

    #[async_trait]
    impl ProposalHandler for NopProposals {
        async fn handle(&self, _: ProposalNotice, _: ProposalResponder) {}
    }

    fn test_client(rng: &mut StdRng) -> Arc<Client> {
        let bank = Arc::new(SimBank::new());
        Client::new(
            Account::new(rng),
            Arc::new(DoNotDialDialer),
            Arc::new(NopProposals),
            Arc::new(crate::channel::AcceptAllUpdates),
            Arc::new(SimFunder::new(bank.clone())),
            Arc::new(SimAdjudicator::new(bank)),
            None,
        )
    }

    fn valid_proposal(rng: &mut StdRng, client: &Client) -> ChannelProposal {
        ChannelProposal {
            challenge_duration: 60,
            nonce: rng.gen(),
            app_def: Address::default(),
            init_data: vec![],
            init_allocation: Allocation::single_asset([100.into(), 100.into()]),
            peers: [client.address(), rng.gen()],
        }
    }

    #[tokio::test]
    async fn zero_challenge_duration_rejected_before_any_send() {
        let mut rng = StdRng::seed_from_u64(0x2020_0123);
        let client = test_client(&mut rng);
        let mut prop = valid_proposal(&mut rng, &client);
        prop.challenge_duration = 0;

        let err = client
            .propose_channel(&Ctx::background(), prop)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidProposal(_)));
    }

    #[tokio::test]
    async fn proposal_must_name_us_first() {
        let mut rng = StdRng::seed_from_u64(0x2020_0124);
        let client = test_client(&mut rng);
        let mut prop = valid_proposal(&mut rng, &client);
        prop.peers[0] = rng.gen();

        let err = client
            .propose_channel(&Ctx::background(), prop)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidProposal(_)));
    }

    #[tokio::test]
    async fn self_channel_rejected() {
        let mut rng = StdRng::seed_from_u64(0x2020_0125);
        let client = test_client(&mut rng);
        let mut prop = valid_proposal(&mut rng, &client);
        prop.peers[1] = client.address();

        let err = client
            .propose_channel(&Ctx::background(), prop)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidProposal(_)));
    }

    #[tokio::test]
    async fn unknown_channel_lookup_fails() {
        let mut rng = StdRng::seed_from_u64(0x2020_0126);
        let client = test_client(&mut rng);
        let id: ChannelId = rng.gen();
        assert!(matches!(
            client.channel(id),
            Err(ClientError::UnknownChannel(_))
        ));
        assert!(client.channels().is_empty());
    }
}
