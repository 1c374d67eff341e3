//! Account keys and recoverable signatures.
//!
//! Signatures are 65-byte `r ‖ s ‖ v` with the Ethereum
//! `\x19Ethereum Signed Message:\n32` prefix applied to the signed hash, so
//! the adjudicator contract can `ecrecover` the signer.

use k256::{
    ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

use crate::types::{Address, Hash, Signature};

pub use k256::ecdsa::Error;

/// Prefixes `hash` with `\x19Ethereum Signed Message:\n32`, the format the
/// on-chain signature check expects.
fn eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding, so the canonical serializer is of no use here.
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

fn verifying_key_address(key: &VerifyingKey) -> Address {
    // The first byte of the uncompressed encoding is the SEC1 tag, not part
    // of the public key.
    let point = key.to_encoded_point(false);
    let hash: [u8; 32] = Keccak256::digest(&point.as_bytes()[1..]).into();

    let mut addr = Address([0; 20]);
    addr.0.copy_from_slice(&hash[32 - 20..]);
    addr
}

/// An account exclusively owns its signing key; only the [`Address`] leaves
/// this struct.
#[derive(Clone)]
pub struct Account {
    key: SigningKey,
    addr: Address,
}

impl core::fmt::Debug for Account {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Account").field("addr", &self.addr).finish()
    }
}

impl Account {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        let addr = verifying_key_address(key.verifying_key());
        Self { key, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Signs `msg` as a 65-byte recoverable signature.
    pub fn sign(&self, msg: Hash) -> Result<Signature, Error> {
        let hash = eth_signed_msg_hash(msg);
        let (sig, rid): (EcdsaSignature, RecoveryId) =
            self.key.sign_prehash_recoverable(&hash.0)?;

        // Signing normalizes s, so the recovery id stays in {0, 1}. The EVM
        // expects v offset by 27.
        let mut rs = [0u8; 64];
        rs.copy_from_slice(&sig.to_bytes());
        Ok(Signature::new(&rs, 27 + rid.to_byte()))
    }
}

/// Recovers the signer address of `sig` over `msg`.
///
/// `msg` is the hash passed to [`Account::sign`], without the signed-message
/// prefix.
pub fn recover_signer(msg: Hash, sig: Signature) -> Result<Address, Error> {
    let hash = eth_signed_msg_hash(msg);

    let v = sig.0[64].checked_sub(27).ok_or_else(Error::new)?;
    let rid = RecoveryId::from_byte(v).ok_or_else(Error::new)?;
    let sig = EcdsaSignature::from_slice(&sig.0[..64])?;

    let key = VerifyingKey::recover_from_prehash(&hash.0, &sig, rid)?;
    Ok(verifying_key_address(&key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn sign_and_recover() {
        let mut rng = StdRng::seed_from_u64(0);
        let acc = Account::new(&mut rng);
        let msg: Hash = rand::Rng::gen(&mut rng);

        let sig = acc.sign(msg).unwrap();
        assert_eq!(recover_signer(msg, sig).unwrap(), acc.address());
    }

    #[test]
    fn recover_rejects_wrong_message() {
        let mut rng = StdRng::seed_from_u64(1);
        let acc = Account::new(&mut rng);
        let msg: Hash = rand::Rng::gen(&mut rng);
        let other: Hash = rand::Rng::gen(&mut rng);

        let sig = acc.sign(msg).unwrap();
        // Recovery over a different message yields some other address.
        assert_ne!(recover_signer(other, sig).unwrap(), acc.address());
    }

    #[test]
    fn recover_rejects_mangled_v() {
        let mut rng = StdRng::seed_from_u64(2);
        let acc = Account::new(&mut rng);
        let msg: Hash = rand::Rng::gen(&mut rng);

        let mut sig = acc.sign(msg).unwrap();
        sig.0[64] = 5; // below the +27 offset
        assert!(recover_signer(msg, sig).is_err());
    }

    #[test]
    fn distinct_accounts_distinct_addresses() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = Account::new(&mut rng);
        let b = Account::new(&mut rng);
        assert_ne!(a.address(), b.address());
    }
}
