//! The census proof wire format and leaf packing rules.
//!
//! A census proof certifies that an address participates in a process's
//! census with some weight. For Merkle censuses it carries siblings and a
//! leaf index; for CSP censuses it carries the provider's public key and
//! signature. Both shapes travel in the same structure so the ballot
//! verifier can dispatch on the persisted origin tag.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::hex_string::hex_string_serde;
use crate::process::CensusOrigin;
use crate::Address;

/// Number of bits the address is shifted left by when packing a leaf.
/// Leaves 88 bits for the weight, keeping the packed value inside the
/// BN254 scalar field.
pub const WEIGHT_BITS: usize = 88;

/// A census inclusion or credential proof.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct CensusProof {
    /// The census root this proof verifies against: a tree root for Merkle
    /// censuses, a public key hash for CSP censuses.
    #[serde(with = "hex_string_serde")]
    pub root: Vec<u8>,
    /// The 20-byte voter address.
    #[serde(with = "hex_string_serde")]
    pub address: Address,
    /// Big-endian packed leaf value `(address << 88) | weight`.
    #[serde(with = "hex_string_serde")]
    pub value: Vec<u8>,
    /// Concatenated 32-byte big-endian sibling limbs, leaf level first.
    /// Empty for CSP proofs.
    #[serde(with = "hex_string_serde")]
    pub siblings: Vec<u8>,
    /// The voter's census weight.
    pub weight: u64,
    /// Leaf index in the census tree. Zero for CSP proofs.
    pub index: u64,
    /// Dispatch tag.
    pub census_origin: CensusOrigin,
    /// CSP verification key (compressed point), absent for Merkle proofs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Vec<u8>>,
    /// CSP signature bytes, absent for Merkle proofs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
}

/// Normalizes an arbitrary-length census key into a 20-byte address:
/// shorter keys are right-padded with zeros, longer keys truncated.
pub fn normalize_census_key(key: &[u8]) -> Address {
    let mut address = [0u8; 20];
    let n = key.len().min(20);
    address[..n].copy_from_slice(&key[..n]);
    address
}

/// Packs `(address << 88) | weight` as a 32-byte big-endian value. The top
/// byte is always zero, so the result fits the BN254 scalar field.
pub fn pack_census_value(address: &Address, weight: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[1..21].copy_from_slice(address);
    out[24..32].copy_from_slice(&weight.to_be_bytes());
    out
}

/// Reverses [`pack_census_value`]. Fails if the weight portion overflows
/// `u64` or the top byte is non-zero.
pub fn unpack_census_value(value: &[u8]) -> Option<(Address, u64)> {
    if value.len() != 32 || value[0] != 0 {
        return None;
    }
    // The weight field is 88 bits wide but only 64 are representable here.
    if value[21..24] != [0u8; 3] {
        return None;
    }
    let mut address = [0u8; 20];
    address.copy_from_slice(&value[1..21]);
    let mut weight = [0u8; 8];
    weight.copy_from_slice(&value[24..32]);
    Some((address, u64::from_be_bytes(weight)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_normalization() {
        // 19 bytes: right-padded.
        let short = vec![0xab; 19];
        let normalized = normalize_census_key(&short);
        assert_eq!(&normalized[..19], &short[..]);
        assert_eq!(normalized[19], 0);

        // 21 bytes: truncated.
        let long = vec![0xcd; 21];
        let normalized = normalize_census_key(&long);
        assert_eq!(normalized, [0xcd; 20]);

        // Exact length passes through.
        let exact = [0x11u8; 20];
        assert_eq!(normalize_census_key(&exact), exact);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let address = [0x42u8; 20];
        let packed = pack_census_value(&address, 1000);
        assert_eq!(packed[0], 0, "top byte must be zero");
        let (addr, weight) = unpack_census_value(&packed).unwrap();
        assert_eq!(addr, address);
        assert_eq!(weight, 1000);
    }

    #[test]
    fn unpack_rejects_malformed() {
        assert!(unpack_census_value(&[0u8; 31]).is_none());

        let mut bad_top = [0u8; 32];
        bad_top[0] = 1;
        assert!(unpack_census_value(&bad_top).is_none());

        let mut overflow = [0u8; 32];
        overflow[21] = 1; // weight bit above 2^64
        assert!(unpack_census_value(&overflow).is_none());
    }

    proptest::proptest! {
        #[test]
        fn pack_unpack_roundtrip_for_any_input(
            address in proptest::prelude::any::<[u8; 20]>(),
            weight in proptest::prelude::any::<u64>(),
        ) {
            let packed = pack_census_value(&address, weight);
            proptest::prop_assert_eq!(unpack_census_value(&packed), Some((address, weight)));
        }

        #[test]
        fn normalization_is_idempotent(
            key in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..40usize),
        ) {
            let once = normalize_census_key(&key);
            proptest::prop_assert_eq!(normalize_census_key(&once), once);
        }
    }

    #[test]
    fn census_proof_json_roundtrip() {
        let proof = CensusProof {
            root: vec![1, 2, 3],
            address: [9u8; 20],
            value: pack_census_value(&[9u8; 20], 5).to_vec(),
            siblings: vec![0u8; 64],
            weight: 5,
            index: 3,
            census_origin: CensusOrigin::MerkleTreeOffchainStatic,
            public_key: None,
            signature: None,
        };
        let json = serde_json::to_string(&proof).unwrap();
        let decoded: CensusProof = serde_json::from_str(&json).unwrap();
        assert_eq!(proof, decoded);

        // Borsh roundtrip matches too; verification must not depend on the
        // serialization form.
        let bytes = borsh::to_vec(&proof).unwrap();
        let decoded: CensusProof = borsh::from_slice(&bytes).unwrap();
        assert_eq!(proof, decoded);
    }
}
