//! Primitive value types shared by the whole crate.

use core::fmt::Debug;

use rand::{distributions::Standard, prelude::Distribution};
use serde::Serialize;
use uint::construct_uint;

/// Index of a participant in the channel.
///
/// `0` is the proposer of the channel.
pub type PartIdx = usize;

/// Number of participants in a channel.
pub const PARTICIPANTS: usize = 2;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

macro_rules! bytes_newtype {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, Hash, PartialOrd, Ord, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                let mut bytes = [0u8; $N];
                rng.fill(&mut bytes[..]);
                $T(bytes)
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_debug!($T);
    };
}

bytes_newtype!(Hash, 32);

/// Deterministically derived channel identifier, `hash(params)`.
pub type ChannelId = Hash;

/// Binds the replies to a channel proposal to the original request,
/// `hash(canonical encoding of the request)`.
pub type SessionId = Hash;

bytes_newtype!(Signature, 65);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

/// 20-byte account identity, the keccak tail of the public key.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);
impl_hex_debug!(Address);

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl Distribution<Address> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Address {
        Address(rng.gen())
    }
}

impl Address {
    /// Parses a 40-digit hex string, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Option<Address> {
        use uint::hex::FromHex;

        let s = s.strip_prefix("0x").unwrap_or(s);
        <[u8; 20]>::from_hex(s).ok().map(Address)
    }
}

construct_uint! {
    pub struct U256(4);
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        serializer.serialize_bytes(&bytes)
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_hex_roundtrip() {
        let addr = Address::from_hex("0x5B38Da6a701c568545dCfcB03FcB875f56beddC4").unwrap();
        assert_eq!(
            format!("{:?}", addr),
            "0x5b38da6a701c568545dcfcb03fcb875f56beddc4"
        );
        assert!(Address::from_hex("abcd").is_none());
    }

    #[test]
    fn u256_big_endian() {
        let v = U256::from(0x1234u64);
        let mut bytes = [0u8; 32];
        v.to_big_endian(&mut bytes);
        assert_eq!(&bytes[30..], &[0x12, 0x34]);
        assert_eq!(U256::from_big_endian(&bytes), v);
    }
}
