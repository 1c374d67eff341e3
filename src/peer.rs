//! Peer connections and the registry that owns them.
//!
//! Each remote identity has at most one live [`Peer`]. A peer owns one
//! duplex bytestream and two tasks: a reader that decodes frames and routes
//! each message to the first matching subscription, and a writer that
//! serializes sends. Subscriptions are registered with an [`Interest`]
//! filter and released when the [`Receiver`] is dropped; closing the peer
//! releases all of them.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};

use crate::ctx::{Ctx, CtxError};
use crate::types::Address;
use crate::wire::{self, Interest, Message, MessageError};

/// A raw bidirectional bytestream. TCP in production, in-memory pipes in
/// tests.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

pub type Conn = Box<dyn Duplex>;

/// Establishes an outbound bytestream to a remote identity.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, ctx: &Ctx, addr: Address) -> io::Result<Conn>;
}

/// Accepts inbound bytestreams.
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> io::Result<Conn>;
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Ctx(#[from] CtxError),
    #[error("dialing failed: {0}")]
    Dial(String),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

struct SubEntry {
    id: u64,
    interest: Interest,
    tx: mpsc::UnboundedSender<Message>,
}

/// Unmatched messages are kept briefly: during channel opening, the peer's
/// first messages legitimately race the creation of their subscriber. The
/// oldest entry is dropped once the cache is full.
const UNMATCHED_CACHE: usize = 32;

#[derive(Default)]
struct SubTable {
    next_id: u64,
    entries: Vec<SubEntry>,
    cache: std::collections::VecDeque<Message>,
}

/// One logical connection to a remote identity.
pub struct Peer {
    remote: Address,
    out_tx: mpsc::Sender<Vec<u8>>,
    subs: Arc<StdMutex<SubTable>>,
    alive: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
}

impl core::fmt::Debug for Peer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Peer")
            .field("remote", &self.remote)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Peer {
    /// Spawns the reader and writer tasks for `conn`.
    pub(crate) fn spawn(remote: Address, conn: Conn) -> Arc<Peer> {
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(16);
        let subs = Arc::new(StdMutex::new(SubTable::default()));
        let alive = Arc::new(AtomicBool::new(true));
        let (close_tx, close_rx) = watch::channel(false);

        let peer = Arc::new(Peer {
            remote,
            out_tx: out_tx.clone(),
            subs: subs.clone(),
            alive: alive.clone(),
            close_tx,
        });

        let (mut read_half, mut write_half) = tokio::io::split(conn);

        // Writer: serializes all sends onto the stream.
        let mut writer_close = close_rx.clone();
        let writer_alive = alive.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = writer_close.changed() => break,
                };
                if let Err(error) = wire::write_frame(&mut write_half, &frame).await {
                    tracing::debug!(peer = ?remote, %error, "write failed, closing connection");
                    break;
                }
            }
            writer_alive.store(false, Ordering::Release);
        });

        // Reader: decodes frames and routes messages to subscribers.
        let mut reader_close = close_rx;
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = wire::read_frame(&mut read_half) => frame,
                    _ = reader_close.changed() => break,
                };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(error) => {
                        tracing::debug!(peer = ?remote, %error, "connection lost");
                        break;
                    }
                };
                let msg = match Message::decode(&frame) {
                    Ok(msg) => msg,
                    Err(error) => {
                        // Malformed input from a Byzantine peer: drop the
                        // frame, keep the connection.
                        tracing::warn!(peer = ?remote, %error, "dropping malformed frame");
                        continue;
                    }
                };
                match msg {
                    Message::Ping(nonce) => {
                        if let Ok(frame) = Message::Pong(nonce).encode() {
                            let _ = out_tx.try_send(frame);
                        }
                    }
                    Message::Pong(_) | Message::Hello(_) => {
                        tracing::trace!(peer = ?remote, msg = msg.name(), "ignoring");
                    }
                    msg => {
                        let mut table = subs.lock().expect("subscription table poisoned");
                        match table.entries.iter().find(|e| e.interest.matches(&msg)) {
                            Some(entry) => {
                                let _ = entry.tx.send(msg);
                            }
                            None => {
                                tracing::debug!(
                                    peer = ?remote,
                                    msg = msg.name(),
                                    "caching unmatched message"
                                );
                                table.cache.push_back(msg);
                                if table.cache.len() > UNMATCHED_CACHE {
                                    if let Some(dropped) = table.cache.pop_front() {
                                        tracing::debug!(
                                            peer = ?remote,
                                            msg = dropped.name(),
                                            "dropping unmatched message"
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
            }
            alive.store(false, Ordering::Release);
            // Dropping the senders releases every subscriber with an error.
            let mut table = subs.lock().expect("subscription table poisoned");
            table.entries.clear();
            table.cache.clear();
        });

        peer
    }

    pub fn remote(&self) -> Address {
        self.remote
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Sends one message; fails if `ctx` dies or the connection closes.
    pub async fn send(&self, ctx: &Ctx, msg: &Message) -> Result<(), PeerError> {
        if !self.is_alive() {
            return Err(PeerError::Closed);
        }
        let frame = msg.encode()?;
        ctx.run(self.out_tx.send(frame))
            .await?
            .map_err(|_| PeerError::Closed)
    }

    /// Registers a subscription for messages matching `interest`. Cached
    /// messages that arrived just before the subscription are delivered
    /// first, in arrival order.
    pub fn subscribe(&self, interest: Interest) -> Result<Receiver, PeerError> {
        if !self.is_alive() {
            return Err(PeerError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.subs.lock().expect("subscription table poisoned");
        let mut kept = std::collections::VecDeque::with_capacity(table.cache.len());
        for msg in table.cache.drain(..) {
            if interest.matches(&msg) {
                let _ = tx.send(msg);
            } else {
                kept.push_back(msg);
            }
        }
        table.cache = kept;
        let id = table.next_id;
        table.next_id += 1;
        table.entries.push(SubEntry { id, interest, tx });
        Ok(Receiver {
            rx,
            _guard: SubGuard {
                id,
                subs: self.subs.clone(),
            },
        })
    }

    /// Tears the connection down; all subscribers see `Closed`.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.close_tx.send(true);
        let mut table = self.subs.lock().expect("subscription table poisoned");
        table.entries.clear();
        table.cache.clear();
    }
}

struct SubGuard {
    id: u64,
    subs: Arc<StdMutex<SubTable>>,
}

impl Drop for SubGuard {
    fn drop(&mut self) {
        if let Ok(mut table) = self.subs.lock() {
            table.entries.retain(|e| e.id != self.id);
        }
    }
}

/// A live subscription. Dropping it unregisters the filter.
pub struct Receiver {
    rx: mpsc::UnboundedReceiver<Message>,
    _guard: SubGuard,
}

impl Receiver {
    /// The next matching message; `Closed` once the peer goes away.
    pub async fn recv(&mut self, ctx: &Ctx) -> Result<Message, PeerError> {
        match ctx.run(self.rx.recv()).await? {
            Some(msg) => Ok(msg),
            None => Err(PeerError::Closed),
        }
    }
}

enum Slot {
    Ready(Arc<Peer>),
    /// A dial is in flight; waiters share its outcome.
    Dialing(watch::Receiver<Option<Result<Arc<Peer>, String>>>),
}

/// Owns all peers, one per remote identity. `get` dials lazily and
/// coalesces concurrent dials to the same address.
pub struct Registry {
    identity: Address,
    dialer: Arc<dyn Dialer>,
    peers: TokioMutex<HashMap<Address, Slot>>,
    events: mpsc::UnboundedSender<Arc<Peer>>,
}

impl Registry {
    /// The returned receiver yields every peer that comes to life, dialed
    /// or accepted; the client listens on it to attach its handlers.
    pub fn new(
        identity: Address,
        dialer: Arc<dyn Dialer>,
    ) -> (Arc<Registry>, mpsc::UnboundedReceiver<Arc<Peer>>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Registry {
                identity,
                dialer,
                peers: TokioMutex::new(HashMap::new()),
                events,
            }),
            events_rx,
        )
    }

    pub fn identity(&self) -> Address {
        self.identity
    }

    /// Returns the live peer for `addr`, dialing if necessary.
    pub async fn get(&self, ctx: &Ctx, addr: Address) -> Result<Arc<Peer>, PeerError> {
        enum Found {
            Ready(Arc<Peer>),
            Wait(watch::Receiver<Option<Result<Arc<Peer>, String>>>),
            Vacant(watch::Sender<Option<Result<Arc<Peer>, String>>>),
        }

        loop {
            let found = {
                let mut peers = self.peers.lock().await;
                let existing = match peers.get(&addr) {
                    Some(Slot::Ready(peer)) if peer.is_alive() => Some(Found::Ready(peer.clone())),
                    Some(Slot::Dialing(rx)) => Some(Found::Wait(rx.clone())),
                    _ => None,
                };
                match existing {
                    Some(found) => found,
                    None => {
                        let (tx, rx) = watch::channel(None);
                        peers.insert(addr, Slot::Dialing(rx));
                        Found::Vacant(tx)
                    }
                }
            };
            match found {
                Found::Ready(peer) => return Ok(peer),
                Found::Vacant(tx) => return self.dial_slot(ctx, addr, tx).await,
                Found::Wait(mut rx) => {
                    let outcome = ctx
                        .run(async {
                            loop {
                                if rx.borrow().is_some() {
                                    break rx.borrow().clone();
                                }
                                if rx.changed().await.is_err() {
                                    break None;
                                }
                            }
                        })
                        .await?;
                    match outcome {
                        Some(Ok(peer)) => return Ok(peer),
                        Some(Err(e)) => return Err(PeerError::Dial(e)),
                        // The dialing task vanished; try again.
                        None => continue,
                    }
                }
            }
        }
    }

    async fn dial_slot(
        &self,
        ctx: &Ctx,
        addr: Address,
        tx: watch::Sender<Option<Result<Arc<Peer>, String>>>,
    ) -> Result<Arc<Peer>, PeerError> {
        let res = self.dial(ctx, addr).await;
        let mut peers = self.peers.lock().await;
        match &res {
            Ok(peer) => {
                peers.insert(addr, Slot::Ready(peer.clone()));
                let _ = tx.send(Some(Ok(peer.clone())));
            }
            Err(error) => {
                peers.remove(&addr);
                let _ = tx.send(Some(Err(error.to_string())));
            }
        }
        res
    }

    async fn dial(&self, ctx: &Ctx, addr: Address) -> Result<Arc<Peer>, PeerError> {
        let mut conn = self.dialer.dial(ctx, addr).await?;
        // Announce ourselves before the connection carries anything else.
        let hello = Message::Hello(wire::Hello {
            sender: self.identity,
        })
        .encode()?;
        ctx.run(wire::write_frame(&mut conn, &hello)).await??;

        tracing::info!(peer = ?addr, "outgoing connection established");
        let peer = Peer::spawn(addr, conn);
        let _ = self.events.send(peer.clone());
        Ok(peer)
    }

    /// Installs an accepted connection whose `Hello` announced `addr`.
    /// An existing live connection to the same identity is replaced.
    pub async fn register_incoming(&self, addr: Address, conn: Conn) -> Arc<Peer> {
        let peer = Peer::spawn(addr, conn);
        let mut peers = self.peers.lock().await;
        if let Some(Slot::Ready(old)) = peers.get(&addr) {
            if old.is_alive() {
                tracing::debug!(peer = ?addr, "replacing existing connection");
                old.close();
            }
        }
        peers.insert(addr, Slot::Ready(peer.clone()));
        drop(peers);
        tracing::info!(peer = ?addr, "incoming connection established");
        let _ = self.events.send(peer.clone());
        peer
    }

    /// Closes every peer.
    pub async fn close(&self) {
        let mut peers = self.peers.lock().await;
        for slot in peers.values() {
            if let Slot::Ready(peer) = slot {
                peer.close();
            }
        }
        peers.clear();
    }
}

/// Dials peers over TCP using a registered address book.
pub struct TcpDialer {
    book: StdRwLock<HashMap<Address, SocketAddr>>,
}

impl TcpDialer {
    pub fn new() -> Self {
        TcpDialer {
            book: StdRwLock::new(HashMap::new()),
        }
    }

    /// Associates a remote identity with its socket address.
    pub fn register(&self, addr: Address, sock: SocketAddr) {
        self.book
            .write()
            .expect("address book poisoned")
            .insert(addr, sock);
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, ctx: &Ctx, addr: Address) -> io::Result<Conn> {
        let sock = {
            let book = self.book.read().expect("address book poisoned");
            book.get(&addr).copied()
        };
        let sock = sock.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no route to {addr:?}"))
        })?;
        let stream = ctx
            .run(tokio::net::TcpStream::connect(sock))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::TimedOut, e))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Listener for tokio::net::TcpListener {
    async fn accept(&mut self) -> io::Result<Conn> {
        let (stream, _) = tokio::net::TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelId, SessionId};
    use crate::wire::{ProposalAcc, UpdateAcc};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::time::Duration;

    fn pipe_pair(a: Address, b: Address) -> (Arc<Peer>, Arc<Peer>) {
        let (left, right) = tokio::io::duplex(4096);
        (
            Peer::spawn(b, Box::new(left)),
            Peer::spawn(a, Box::new(right)),
        )
    }

    fn ctx() -> Ctx {
        Ctx::background().with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn routes_by_interest() {
        let mut rng = StdRng::seed_from_u64(0);
        let (alice, bob) = pipe_pair(rng.gen(), rng.gen());
        let session: SessionId = rng.gen();

        let mut sub = bob
            .subscribe(Interest::ProposalResponses { session })
            .unwrap();

        // Non-matching session is dropped, matching one is delivered.
        let other = Message::ProposalAcc(ProposalAcc {
            session_id: rng.gen(),
            participant: rng.gen(),
        });
        let wanted = Message::ProposalAcc(ProposalAcc {
            session_id: session,
            participant: rng.gen(),
        });
        alice.send(&ctx(), &other).await.unwrap();
        alice.send(&ctx(), &wanted).await.unwrap();

        assert_eq!(sub.recv(&ctx()).await.unwrap(), wanted);
    }

    #[tokio::test]
    async fn version_filter_applies() {
        let mut rng = StdRng::seed_from_u64(1);
        let (alice, bob) = pipe_pair(rng.gen(), rng.gen());
        let channel: ChannelId = rng.gen();

        let mut sub = bob
            .subscribe(Interest::UpdateResponses { channel, version: 2 })
            .unwrap();

        for version in [1, 2] {
            let msg = Message::UpdateAcc(UpdateAcc {
                channel_id: channel,
                version,
                sig: rng.gen(),
            });
            alice.send(&ctx(), &msg).await.unwrap();
        }

        match sub.recv(&ctx()).await.unwrap() {
            Message::UpdateAcc(acc) => assert_eq!(acc.version, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_arriving_before_subscription_is_delivered() {
        let mut rng = StdRng::seed_from_u64(7);
        let (alice, bob) = pipe_pair(rng.gen(), rng.gen());
        let channel: ChannelId = rng.gen();

        // Arrives while nobody listens for it yet.
        let early = Message::UpdateAcc(UpdateAcc {
            channel_id: channel,
            version: 0,
            sig: rng.gen(),
        });
        alice.send(&ctx(), &early).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut sub = bob
            .subscribe(Interest::UpdateResponses {
                channel,
                version: 0,
            })
            .unwrap();
        assert_eq!(sub.recv(&ctx()).await.unwrap(), early);
    }

    #[tokio::test]
    async fn close_releases_subscribers() {
        let mut rng = StdRng::seed_from_u64(2);
        let (alice, bob) = pipe_pair(rng.gen(), rng.gen());
        let mut sub = bob
            .subscribe(Interest::UpdateReqs {
                channel: rng.gen(),
            })
            .unwrap();

        bob.close();
        assert!(matches!(sub.recv(&ctx()).await, Err(PeerError::Closed)));
        // Alice's own end has not been closed locally.
        assert!(alice.subscribe(Interest::ProposalReqs).is_ok());
    }

    #[tokio::test]
    async fn recv_observes_ctx_deadline() {
        let mut rng = StdRng::seed_from_u64(3);
        let (_alice, bob) = pipe_pair(rng.gen(), rng.gen());
        let mut sub = bob.subscribe(Interest::ProposalReqs).unwrap();

        let short = Ctx::background().with_timeout(Duration::from_millis(20));
        assert!(matches!(
            sub.recv(&short).await,
            Err(PeerError::Ctx(CtxError::DeadlineExceeded))
        ));
    }

    #[tokio::test]
    async fn ping_answered_without_subscribers() {
        let mut rng = StdRng::seed_from_u64(4);
        let a: Address = rng.gen();
        let b: Address = rng.gen();
        let (left, right) = tokio::io::duplex(4096);
        let alice = Peer::spawn(b, Box::new(left));
        let mut raw = right;

        alice.send(&ctx(), &Message::Ping(42)).await.unwrap();
        // Read the ping off the raw end and answer; then ping alice and
        // expect her automatic pong.
        let frame = wire::read_frame(&mut raw).await.unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), Message::Ping(42));

        let ping = Message::Ping(7).encode().unwrap();
        wire::write_frame(&mut raw, &ping).await.unwrap();
        let frame = wire::read_frame(&mut raw).await.unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), Message::Pong(7));
        let _ = (a, b);
    }
}
