//! Protocol messages and their bit-exact wire encoding.
//!
//! A frame on the wire is a 32-bit big-endian length followed by one
//! encoded message: a single tag byte and the canonical encoding of the
//! message body (see [`crate::codec`]). Decoding is strict; a frame that
//! does not parse exactly is a protocol error and the connection layer
//! drops it.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::channel::state::{Allocation, AllocationError, State};
use crate::codec::{self, DecodeError, Decoder, EncodeError};
use crate::types::{Address, ChannelId, SessionId, Signature, U256, PARTICIPANTS};

/// Upper bound for a rejection reason, in bytes of UTF-8.
pub const MAX_REASON_LEN: usize = 256;
/// Upper bound for application data carried in a state.
pub const MAX_APP_DATA_LEN: usize = 64 * 1024;
/// Assets per allocation a peer may send us.
pub const MAX_ASSETS: usize = 32;
/// Hard cap on a single frame.
pub const MAX_FRAME_LEN: usize = 1 << 20;

const TAG_HELLO: u8 = 0;
const TAG_PROPOSAL_REQ: u8 = 1;
const TAG_PROPOSAL_ACC: u8 = 2;
const TAG_PROPOSAL_REJ: u8 = 3;
const TAG_UPDATE_REQ: u8 = 4;
const TAG_UPDATE_ACC: u8 = 5;
const TAG_UPDATE_REJ: u8 = 6;
const TAG_PING: u8 = 7;
const TAG_PONG: u8 = 8;

/// First frame on every connection: announces the dialer's identity so the
/// acceptor can key the peer in its registry.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub sender: Address,
}

/// Opens the channel-proposal handshake.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProposalReq {
    pub challenge_duration: u64,
    pub nonce: U256,
    /// The proposer's channel participant (index 0).
    pub participant: Address,
    pub app_def: Address,
    pub init_data: Vec<u8>,
    pub init_allocation: Allocation,
    /// Wire identities; `peers[0]` is the proposer.
    pub peers: [Address; PARTICIPANTS],
}

impl ProposalReq {
    /// Deterministic digest binding replies to this request. Both peers
    /// compute it independently from the request bytes.
    pub fn session_id(&self) -> Result<SessionId, EncodeError> {
        codec::to_sha3_hash(self)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalAcc {
    pub session_id: SessionId,
    /// The acceptor's channel participant (index 1).
    pub participant: Address,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProposalRej {
    pub session_id: SessionId,
    pub reason: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct UpdateReq {
    pub channel_id: ChannelId,
    pub state: State,
    pub actor_idx: u16,
    pub sig: Signature,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAcc {
    pub channel_id: ChannelId,
    pub version: u64,
    pub sig: Signature,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct UpdateRej {
    pub channel_id: ChannelId,
    pub version: u64,
    pub reason: String,
}

/// The tagged sum carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    ProposalReq(ProposalReq),
    ProposalAcc(ProposalAcc),
    ProposalRej(ProposalRej),
    UpdateReq(UpdateReq),
    UpdateAcc(UpdateAcc),
    UpdateRej(UpdateRej),
    Ping(u64),
    Pong(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("empty frame")]
    EmptyFrame,
    #[error("malformed allocation")]
    Allocation(#[from] AllocationError),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::ProposalReq(_) => "proposal-req",
            Message::ProposalAcc(_) => "proposal-acc",
            Message::ProposalRej(_) => "proposal-rej",
            Message::UpdateReq(_) => "update-req",
            Message::UpdateAcc(_) => "update-acc",
            Message::UpdateRej(_) => "update-rej",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let (tag, mut buf) = match self {
            Message::Hello(m) => (TAG_HELLO, body(m)?),
            Message::ProposalReq(m) => (TAG_PROPOSAL_REQ, body(m)?),
            Message::ProposalAcc(m) => (TAG_PROPOSAL_ACC, body(m)?),
            Message::ProposalRej(m) => (TAG_PROPOSAL_REJ, body(m)?),
            Message::UpdateReq(m) => (TAG_UPDATE_REQ, body(m)?),
            Message::UpdateAcc(m) => (TAG_UPDATE_ACC, body(m)?),
            Message::UpdateRej(m) => (TAG_UPDATE_REJ, body(m)?),
            Message::Ping(nonce) => (TAG_PING, body(nonce)?),
            Message::Pong(nonce) => (TAG_PONG, body(nonce)?),
        };
        buf.insert(0, tag);
        Ok(buf)
    }

    pub fn decode(frame: &[u8]) -> Result<Message, MessageError> {
        let (&tag, rest) = frame.split_first().ok_or(MessageError::EmptyFrame)?;
        let mut dec = Decoder::new(rest);
        let msg = match tag {
            TAG_HELLO => Message::Hello(Hello {
                sender: dec.address()?,
            }),
            TAG_PROPOSAL_REQ => Message::ProposalReq(ProposalReq {
                challenge_duration: dec.u64()?,
                nonce: dec.u256()?,
                participant: dec.address()?,
                app_def: dec.address()?,
                init_data: dec.bytes(MAX_APP_DATA_LEN)?,
                init_allocation: decode_allocation(&mut dec)?,
                peers: [dec.address()?, dec.address()?],
            }),
            TAG_PROPOSAL_ACC => Message::ProposalAcc(ProposalAcc {
                session_id: dec.hash()?,
                participant: dec.address()?,
            }),
            TAG_PROPOSAL_REJ => Message::ProposalRej(ProposalRej {
                session_id: dec.hash()?,
                reason: dec.string(MAX_REASON_LEN)?,
            }),
            TAG_UPDATE_REQ => Message::UpdateReq(UpdateReq {
                channel_id: dec.hash()?,
                state: decode_state(&mut dec)?,
                actor_idx: dec.u16()?,
                sig: dec.signature()?,
            }),
            TAG_UPDATE_ACC => Message::UpdateAcc(UpdateAcc {
                channel_id: dec.hash()?,
                version: dec.u64()?,
                sig: dec.signature()?,
            }),
            TAG_UPDATE_REJ => Message::UpdateRej(UpdateRej {
                channel_id: dec.hash()?,
                version: dec.u64()?,
                reason: dec.string(MAX_REASON_LEN)?,
            }),
            TAG_PING => Message::Ping(dec.u64()?),
            TAG_PONG => Message::Pong(dec.u64()?),
            tag => return Err(MessageError::UnknownTag(tag)),
        };
        dec.finish()?;
        Ok(msg)
    }
}

fn body<T: Serialize>(value: &T) -> Result<Vec<u8>, MessageError> {
    Ok(codec::to_bytes(value)?)
}

fn decode_allocation(dec: &mut Decoder<'_>) -> Result<Allocation, MessageError> {
    let assets = dec.seq_len(MAX_ASSETS)?;
    let mut balances = Vec::with_capacity(assets);
    for _ in 0..assets {
        let parts = dec.seq_len(PARTICIPANTS)?;
        let mut bals = Vec::with_capacity(parts);
        for _ in 0..parts {
            bals.push(dec.u256()?);
        }
        balances.push(bals);
    }
    Ok(Allocation::new(balances)?)
}

fn decode_state(dec: &mut Decoder<'_>) -> Result<State, MessageError> {
    let channel_id = dec.hash()?;
    let version = dec.u64()?;
    let allocation = decode_allocation(dec)?;
    let app_data = dec.bytes(MAX_APP_DATA_LEN)?;
    let is_final = dec.bool()?;
    Ok(State::from_parts(
        channel_id, version, allocation, app_data, is_final,
    ))
}

/// Clamps a rejection reason to [`MAX_REASON_LEN`] bytes on a char
/// boundary.
pub(crate) fn clamp_reason(reason: &str) -> String {
    if reason.len() <= MAX_REASON_LEN {
        return reason.to_string();
    }
    let mut end = MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// What a subscriber wants delivered. Proposal replies are matched on
/// session id, channel traffic on channel id (and version, for replies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    ProposalReqs,
    ProposalResponses { session: SessionId },
    UpdateReqs { channel: ChannelId },
    UpdateResponses { channel: ChannelId, version: u64 },
}

impl Interest {
    pub fn matches(&self, msg: &Message) -> bool {
        match (self, msg) {
            (Interest::ProposalReqs, Message::ProposalReq(_)) => true,
            (Interest::ProposalResponses { session }, Message::ProposalAcc(m)) => {
                m.session_id == *session
            }
            (Interest::ProposalResponses { session }, Message::ProposalRej(m)) => {
                m.session_id == *session
            }
            (Interest::UpdateReqs { channel }, Message::UpdateReq(m)) => {
                m.channel_id == *channel
            }
            (Interest::UpdateResponses { channel, version }, Message::UpdateAcc(m)) => {
                m.channel_id == *channel && m.version == *version
            }
            (Interest::UpdateResponses { channel, version }, Message::UpdateRej(m)) => {
                m.channel_id == *channel && m.version == *version
            }
            _ => false,
        }
    }
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R>(r: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} out of bounds"),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(w: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "frame too large")
    })?;
    if len as usize > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn sample_req(rng: &mut StdRng) -> ProposalReq {
        ProposalReq {
            challenge_duration: 60,
            nonce: rng.gen(),
            participant: rng.gen(),
            app_def: Address::default(),
            init_data: vec![],
            init_allocation: Allocation::single_asset([100.into(), 100.into()]),
            peers: [rng.gen(), rng.gen()],
        }
    }

    fn roundtrip(msg: Message) {
        let bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn all_messages_roundtrip() {
        let mut rng = StdRng::seed_from_u64(0xbeef);
        let req = sample_req(&mut rng);
        let session = req.session_id().unwrap();
        let state = State::initial(
            rng.gen(),
            Allocation::single_asset([3.into(), 4.into()]),
            b"app".to_vec(),
        );

        roundtrip(Message::Hello(Hello { sender: rng.gen() }));
        roundtrip(Message::ProposalReq(req));
        roundtrip(Message::ProposalAcc(ProposalAcc {
            session_id: session,
            participant: rng.gen(),
        }));
        roundtrip(Message::ProposalRej(ProposalRej {
            session_id: session,
            reason: "no".into(),
        }));
        roundtrip(Message::UpdateReq(UpdateReq {
            channel_id: state.channel_id(),
            state: state.clone(),
            actor_idx: 1,
            sig: rng.gen(),
        }));
        roundtrip(Message::UpdateAcc(UpdateAcc {
            channel_id: state.channel_id(),
            version: 3,
            sig: rng.gen(),
        }));
        roundtrip(Message::UpdateRej(UpdateRej {
            channel_id: state.channel_id(),
            version: 3,
            reason: "stale".into(),
        }));
        roundtrip(Message::Ping(7));
        roundtrip(Message::Pong(7));
    }

    #[test]
    fn session_id_is_deterministic_and_binding() {
        let mut rng = StdRng::seed_from_u64(1);
        let req = sample_req(&mut rng);

        // Same bytes, same id, on both "peers".
        let reencoded = Message::decode(&Message::ProposalReq(req.clone()).encode().unwrap());
        let Ok(Message::ProposalReq(peer_view)) = reencoded else {
            panic!("decode failed");
        };
        assert_eq!(req.session_id().unwrap(), peer_view.session_id().unwrap());

        let mut other = req;
        other.challenge_duration += 1;
        assert_ne!(
            other.session_id().unwrap(),
            peer_view.session_id().unwrap()
        );
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            Message::decode(&[0x7f, 0, 0]),
            Err(MessageError::UnknownTag(0x7f))
        ));
        assert!(matches!(
            Message::decode(&[]),
            Err(MessageError::EmptyFrame)
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = Message::Ping(1).encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            Message::decode(&bytes),
            Err(MessageError::Decode(DecodeError::TrailingBytes(1)))
        ));
    }

    #[test]
    fn oversized_reason_rejected() {
        let msg = Message::ProposalRej(ProposalRej {
            session_id: SessionId::default(),
            reason: "x".repeat(MAX_REASON_LEN + 1),
        });
        let bytes = msg.encode().unwrap();
        assert!(matches!(
            Message::decode(&bytes),
            Err(MessageError::Decode(DecodeError::LengthOutOfRange { .. }))
        ));
    }

    #[test]
    fn clamp_reason_respects_char_boundaries() {
        let long = "ä".repeat(200); // 400 bytes
        let clamped = clamp_reason(&long);
        assert!(clamped.len() <= MAX_REASON_LEN);
        assert!(long.starts_with(&clamped));
        assert_eq!(clamp_reason("short"), "short");
    }

    #[test]
    fn interest_matching() {
        let mut rng = StdRng::seed_from_u64(2);
        let channel: ChannelId = rng.gen();
        let session: SessionId = rng.gen();

        let acc = Message::UpdateAcc(UpdateAcc {
            channel_id: channel,
            version: 4,
            sig: rng.gen(),
        });
        assert!(Interest::UpdateResponses { channel, version: 4 }.matches(&acc));
        assert!(!Interest::UpdateResponses { channel, version: 5 }.matches(&acc));
        assert!(!Interest::UpdateReqs { channel }.matches(&acc));

        let rej = Message::ProposalRej(ProposalRej {
            session_id: session,
            reason: String::new(),
        });
        assert!(Interest::ProposalResponses { session }.matches(&rej));
        let other: SessionId = rng.gen();
        assert!(!Interest::ProposalResponses { session: other }.matches(&rej));
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, b"hello").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }
}
