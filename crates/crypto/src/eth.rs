//! Ethereum-flavored primitives: keccak-256 and ECDSA address recovery.
//!
//! Ballots are tied to their census entry by a secp256k1 signature from the
//! voter's Ethereum key; the sequencer never sees the key, only recovers the
//! address and compares it with the one the ballot claims.

use ethers_core::k256::ecdsa::SigningKey;
use ethers_core::types::{Signature, H160, H256, U256};
pub use ethers_core::utils::keccak256;

use crate::CryptoError;

/// Recovers the signer address of a 65-byte `(r, s, v)` signature over the
/// given 32-byte digest.
pub fn recover_address(signature: &[u8], digest: [u8; 32]) -> Result<H160, CryptoError> {
    let sig = Signature::try_from(signature)
        .map_err(|e| CryptoError::Malformed(format!("ecdsa signature: {e}")))?;
    sig.recover(H256(digest))
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Signs a 32-byte digest with a raw secp256k1 secret key, producing the
/// 65-byte recoverable encoding. Used by test fixtures and local tooling;
/// production ballots arrive already signed.
pub fn sign_digest(secret: &[u8; 32], digest: [u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let key = SigningKey::from_slice(secret)
        .map_err(|e| CryptoError::Malformed(format!("secret key: {e}")))?;
    let (sig, recovery_id) = key
        .sign_prehash_recoverable(&digest)
        .map_err(|e| CryptoError::Malformed(format!("signing: {e}")))?;
    let r_bytes = sig.r().to_bytes();
    let s_bytes = sig.s().to_bytes();
    let signature = Signature {
        r: U256::from_big_endian(r_bytes.as_slice()),
        s: U256::from_big_endian(s_bytes.as_slice()),
        v: recovery_id.to_byte() as u64 + 27,
    };
    Ok(signature.to_vec())
}

/// The Ethereum address of a raw secp256k1 secret key.
pub fn address_of(secret: &[u8; 32]) -> Result<H160, CryptoError> {
    let key = SigningKey::from_slice(secret)
        .map_err(|e| CryptoError::Malformed(format!("secret key: {e}")))?;
    Ok(ethers_core::utils::secret_key_to_address(&key))
}
