//! Two-party off-chain payment channels.
//!
//! Two peers lock collateral with an on-chain asset holder, then exchange
//! jointly signed state updates that re-allocate it without touching the
//! chain. A channel is closed either cooperatively (both sign a final state)
//! or unilaterally by registering the latest fully signed state with the
//! adjudicator and withdrawing after the challenge period.
//!
//! The [`Client`] is the entry point: it owns the local identity, the peer
//! connections and one [`channel::Channel`] controller per open channel.

pub mod adjudicator;
pub mod channel;
pub mod client;
pub mod codec;
pub mod ctx;
pub mod peer;
pub mod persist;
pub mod sig;
pub mod sim;
pub mod types;
pub mod wire;

pub use client::Client;
pub use ctx::Ctx;
pub use sig::Account;
pub use types::{Address, ChannelId, Hash, PartIdx, SessionId, Signature, U256};
