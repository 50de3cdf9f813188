//! Poseidon hashing over the BN254 scalar field.
//!
//! This is the hash every tree node, inputs hash and CSP message in the
//! system goes through. The permutation accepts at most [`MAX_INPUTS`] field
//! elements; longer inputs are absorbed in chunks with the running digest
//! carried into the next permutation.

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use once_cell::sync::Lazy;
use poseidon_ark::Poseidon;

use crate::CryptoError;

/// Maximum number of inputs a single permutation absorbs.
pub const MAX_INPUTS: usize = 16;

static POSEIDON: Lazy<Poseidon> = Lazy::new(Poseidon::new);

/// Hashes up to [`MAX_INPUTS`] field elements.
pub fn hash(inputs: &[Fr]) -> Result<Fr, CryptoError> {
    POSEIDON.hash(inputs.to_vec()).map_err(CryptoError::Hash)
}

/// Hashes an arbitrary number of field elements by chaining permutations:
/// the digest of each chunk is prepended to the next.
pub fn hash_chain(inputs: &[Fr]) -> Result<Fr, CryptoError> {
    if inputs.is_empty() {
        return Err(CryptoError::Hash("empty input".to_string()));
    }
    let mut chunks = inputs.chunks(MAX_INPUTS - 1);
    let first = chunks.next().expect("non-empty input has a first chunk");
    let mut acc = hash(first)?;
    for chunk in chunks {
        let mut with_acc = Vec::with_capacity(chunk.len() + 1);
        with_acc.push(acc);
        with_acc.extend_from_slice(chunk);
        acc = hash(&with_acc)?;
    }
    Ok(acc)
}

/// Interprets big-endian bytes as a field element, reducing mod the field
/// order. Used wherever foreign 32-byte identifiers (vote ids, roots) enter
/// the circuit domain.
pub fn fr_from_be_bytes(bytes: &[u8]) -> Fr {
    Fr::from_be_bytes_mod_order(bytes)
}

/// Canonical 32-byte big-endian encoding of a field element.
pub fn fr_to_be_bytes(fr: &Fr) -> [u8; 32] {
    let repr = fr.into_bigint().to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - repr.len()..].copy_from_slice(&repr);
    out
}

#[cfg(test)]
mod tests {
    use ark_ff::Zero;

    use super::*;

    #[test]
    fn known_vector_matches_circom_poseidon() {
        // poseidon([1, 2]) from the circomlib reference implementation.
        let h = hash(&[Fr::from(1u64), Fr::from(2u64)]).unwrap();
        let expected = fr_from_be_bytes(
            &hex::decode("115cc0f5e7d690413df64c6b9662e9cf2a3617f2743245519e19607a4417189a")
                .unwrap(),
        );
        assert_eq!(h, expected);
    }

    #[test]
    fn be_bytes_roundtrip() {
        let x = Fr::from(123456789u64);
        assert_eq!(fr_from_be_bytes(&fr_to_be_bytes(&x)), x);

        let zero = Fr::zero();
        assert_eq!(fr_to_be_bytes(&zero), [0u8; 32]);
    }

    #[test]
    fn hash_chain_differs_from_flat_hash_and_is_stable() {
        let inputs: Vec<Fr> = (0..40u64).map(Fr::from).collect();
        let a = hash_chain(&inputs).unwrap();
        let b = hash_chain(&inputs).unwrap();
        assert_eq!(a, b);

        // Short inputs go through a single permutation.
        let short: Vec<Fr> = (0..4u64).map(Fr::from).collect();
        assert_eq!(hash_chain(&short).unwrap(), hash(&short).unwrap());
    }

    #[test]
    fn too_many_inputs_is_an_error() {
        let inputs = vec![Fr::zero(); MAX_INPUTS + 1];
        assert!(hash(&inputs).is_err());
        assert!(hash_chain(&inputs).is_ok());
    }
}
