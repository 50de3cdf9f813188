//! Pluggable census proof verifiers.
//!
//! Every census origin verifies the same wire structure ([`CensusProof`])
//! in its own way: the Merkle variant recomputes the tree root, the CSP
//! variants check an EdDSA signature from a credential service provider
//! whose public key hash doubles as the census root. This layer rejects
//! structurally invalid proofs before they reach the prover; semantic
//! enforcement belongs to the ballot circuit.

use std::collections::HashMap;

use scrutiny_crypto::eddsa::{Signature, SigningKey, VerifyingKey};
use scrutiny_crypto::eth::keccak256;
use scrutiny_crypto::poseidon;
use scrutiny_interface::census::{pack_census_value, unpack_census_value};
use scrutiny_interface::process::{CensusOrigin, ProcessId};
use scrutiny_interface::{Address, CensusProof};
use thiserror::Error;

use crate::db::CensusDb;

type BabyJubJub = ark_ed_on_bn254::EdwardsConfig;
type EdBls12377 = ark_ed_on_bls12_377::EdwardsConfig;

/// Census proof rejection reasons.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// The Merkle recomputation or CSP signature check failed.
    #[error("invalid signature or inclusion proof")]
    InvalidSignature,
    /// The proof's origin tag does not match the verifier's.
    #[error("census origin mismatch")]
    OriginMismatch,
    /// A required field is missing or undecodable.
    #[error("malformed census proof: {0}")]
    Malformed(String),
}

/// A verifier for one census origin.
pub trait CensusProofVerifier: Send + Sync {
    /// The origin this verifier handles.
    fn census_origin(&self) -> CensusOrigin;

    /// Checks `proof` for the given process.
    fn verify(&self, process_id: &ProcessId, proof: &CensusProof) -> Result<(), VerifyError>;
}

/// The digest a CSP signs: Poseidon over (process id, address, weight),
/// serialized big-endian. Each CSP curve reduces it into its own scalar
/// field.
pub fn csp_message(process_id: &ProcessId, address: &Address, weight: u64) -> [u8; 32] {
    let digest = poseidon::hash(&[
        poseidon::fr_from_be_bytes(&process_id.to_bytes()),
        poseidon::fr_from_be_bytes(address),
        ark_bn254::Fr::from(weight),
    ])
    .expect("three inputs always hash");
    poseidon::fr_to_be_bytes(&digest)
}

/// Domain-separation tag for a CSP origin. BabyJubJub and its BN254-native
/// deployment flavor share a curve but not a domain, so their censuses stay
/// distinct.
fn csp_domain(origin: CensusOrigin) -> &'static [u8] {
    match origin {
        CensusOrigin::CspEddsaBabyJubJub => b"csp-eddsa-babyjubjub",
        CensusOrigin::CspEddsaBn254 => b"csp-eddsa-bn254",
        CensusOrigin::CspEddsaBls12377 => b"csp-eddsa-bls12-377",
        CensusOrigin::MerkleTreeOffchainStatic => b"",
    }
}

/// Merkle inclusion verifier for static off-chain censuses.
pub struct MerkleVerifier;

impl CensusProofVerifier for MerkleVerifier {
    fn census_origin(&self) -> CensusOrigin {
        CensusOrigin::MerkleTreeOffchainStatic
    }

    fn verify(&self, _process_id: &ProcessId, proof: &CensusProof) -> Result<(), VerifyError> {
        if proof.census_origin != self.census_origin() {
            return Err(VerifyError::OriginMismatch);
        }
        if proof.root.is_empty() {
            return Err(VerifyError::Malformed("empty root".to_string()));
        }
        if unpack_census_value(&proof.value).is_none() {
            return Err(VerifyError::Malformed("unpackable value".to_string()));
        }
        if CensusDb::verify_proof(proof) {
            Ok(())
        } else {
            Err(VerifyError::InvalidSignature)
        }
    }
}

/// EdDSA verifier for one CSP curve, generic over the curve config.
struct CspVerifier<P: ark_ec::twisted_edwards::TECurveConfig> {
    origin: CensusOrigin,
    _curve: std::marker::PhantomData<P>,
}

impl<P: ark_ec::twisted_edwards::TECurveConfig> CspVerifier<P> {
    fn new(origin: CensusOrigin) -> Self {
        Self {
            origin,
            _curve: std::marker::PhantomData,
        }
    }
}

impl<P> CensusProofVerifier for CspVerifier<P>
where
    P: ark_ec::twisted_edwards::TECurveConfig + Send + Sync,
{
    fn census_origin(&self) -> CensusOrigin {
        self.origin
    }

    fn verify(&self, process_id: &ProcessId, proof: &CensusProof) -> Result<(), VerifyError> {
        if proof.census_origin != self.origin {
            return Err(VerifyError::OriginMismatch);
        }
        let public_key = proof
            .public_key
            .as_ref()
            .ok_or_else(|| VerifyError::Malformed("missing public key".to_string()))?;
        let signature = proof
            .signature
            .as_ref()
            .ok_or_else(|| VerifyError::Malformed("missing signature".to_string()))?;

        // The key's hash is the census root: a proof under a different
        // provider's key simply doesn't belong to this census.
        if keccak256(public_key).as_slice() != proof.root.as_slice() {
            return Err(VerifyError::InvalidSignature);
        }
        if proof.value != pack_census_value(&proof.address, proof.weight) {
            return Err(VerifyError::Malformed("inconsistent packed value".to_string()));
        }

        let key = VerifyingKey::<P>::from_bytes(public_key)
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let sig = Signature::<P>::from_bytes(signature)
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let message = csp_message(process_id, &proof.address, proof.weight);
        key.verify(csp_domain(self.origin), &message, &sig)
            .map_err(|_| VerifyError::InvalidSignature)
    }
}

/// A credential service provider: holds the signing key and issues census
/// proofs for eligible voters.
pub struct CspSigner<P: ark_ec::twisted_edwards::TECurveConfig> {
    origin: CensusOrigin,
    key: SigningKey<P>,
}

impl<P> CspSigner<P>
where
    P: ark_ec::twisted_edwards::TECurveConfig,
{
    pub fn new(origin: CensusOrigin, key: SigningKey<P>) -> Self {
        Self { origin, key }
    }

    /// The census root processes using this provider declare: the keccak
    /// hash of the compressed verification key.
    pub fn census_root(&self) -> Vec<u8> {
        keccak256(self.key.verifying_key().to_bytes()).to_vec()
    }

    /// Issues a census proof certifying `(address, weight)` for a process.
    pub fn generate(
        &self,
        process_id: &ProcessId,
        address: &Address,
        weight: u64,
    ) -> CensusProof {
        let message = csp_message(process_id, address, weight);
        let signature = self.key.sign(csp_domain(self.origin), &message);
        CensusProof {
            root: self.census_root(),
            address: *address,
            value: pack_census_value(address, weight).to_vec(),
            siblings: Vec::new(),
            weight,
            index: 0,
            census_origin: self.origin,
            public_key: Some(self.key.verifying_key().to_bytes()),
            signature: Some(signature.to_bytes()),
        }
    }
}

/// Maps persisted origin tags to their verifiers. The ballot verifier
/// dispatches through this.
pub struct VerifierRegistry {
    verifiers: HashMap<CensusOrigin, Box<dyn CensusProofVerifier>>,
}

impl Default for VerifierRegistry {
    fn default() -> Self {
        let mut verifiers: HashMap<CensusOrigin, Box<dyn CensusProofVerifier>> = HashMap::new();
        verifiers.insert(
            CensusOrigin::MerkleTreeOffchainStatic,
            Box::new(MerkleVerifier),
        );
        verifiers.insert(
            CensusOrigin::CspEddsaBabyJubJub,
            Box::new(CspVerifier::<BabyJubJub>::new(
                CensusOrigin::CspEddsaBabyJubJub,
            )),
        );
        verifiers.insert(
            CensusOrigin::CspEddsaBn254,
            Box::new(CspVerifier::<BabyJubJub>::new(CensusOrigin::CspEddsaBn254)),
        );
        verifiers.insert(
            CensusOrigin::CspEddsaBls12377,
            Box::new(CspVerifier::<EdBls12377>::new(
                CensusOrigin::CspEddsaBls12377,
            )),
        );
        Self { verifiers }
    }
}

impl VerifierRegistry {
    /// Verifies `proof` with the verifier its origin tag selects.
    pub fn verify(
        &self,
        process_id: &ProcessId,
        proof: &CensusProof,
    ) -> Result<(), VerifyError> {
        let verifier = self
            .verifiers
            .get(&proof.census_origin)
            .ok_or(VerifyError::OriginMismatch)?;
        verifier.verify(process_id, proof)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn pid() -> ProcessId {
        ProcessId {
            chain_id: 1,
            organization: [3u8; 20],
            nonce: 1,
        }
    }

    #[test]
    fn csp_proof_generate_verify() {
        let mut rng = StdRng::seed_from_u64(21);
        let signer = CspSigner::<BabyJubJub>::new(
            CensusOrigin::CspEddsaBabyJubJub,
            SigningKey::generate(&mut rng),
        );
        let registry = VerifierRegistry::default();

        let proof = signer.generate(&pid(), &[5u8; 20], 12);
        registry.verify(&pid(), &proof).unwrap();

        // A different process id invalidates the signature.
        let other = ProcessId { nonce: 2, ..pid() };
        assert_eq!(
            registry.verify(&other, &proof),
            Err(VerifyError::InvalidSignature)
        );

        // Tampered weight invalidates the packed value first.
        let mut tampered = proof.clone();
        tampered.weight += 1;
        assert!(matches!(
            registry.verify(&pid(), &tampered),
            Err(VerifyError::Malformed(_))
        ));
    }

    #[test]
    fn csp_origins_are_domain_separated() {
        let mut rng = StdRng::seed_from_u64(22);
        let key = SigningKey::<BabyJubJub>::generate(&mut rng);
        let babyjubjub =
            CspSigner::<BabyJubJub>::new(CensusOrigin::CspEddsaBabyJubJub, key.clone());
        let bn254 = CspSigner::<BabyJubJub>::new(CensusOrigin::CspEddsaBn254, key);
        let registry = VerifierRegistry::default();

        let mut cross = babyjubjub.generate(&pid(), &[5u8; 20], 1);
        registry.verify(&pid(), &cross).unwrap();

        // Re-tagging a BabyJubJub proof as BN254 fails: the domains differ.
        cross.census_origin = CensusOrigin::CspEddsaBn254;
        assert_eq!(
            registry.verify(&pid(), &cross),
            Err(VerifyError::InvalidSignature)
        );

        // A properly issued BN254 proof passes.
        let native = bn254.generate(&pid(), &[5u8; 20], 1);
        registry.verify(&pid(), &native).unwrap();
    }

    #[test]
    fn csp_bls12_377_roundtrip() {
        let mut rng = StdRng::seed_from_u64(23);
        let signer = CspSigner::<EdBls12377>::new(
            CensusOrigin::CspEddsaBls12377,
            SigningKey::generate(&mut rng),
        );
        let registry = VerifierRegistry::default();
        let proof = signer.generate(&pid(), &[9u8; 20], 3);
        registry.verify(&pid(), &proof).unwrap();
    }

    #[test]
    fn missing_csp_fields_are_malformed() {
        let mut rng = StdRng::seed_from_u64(24);
        let signer = CspSigner::<BabyJubJub>::new(
            CensusOrigin::CspEddsaBabyJubJub,
            SigningKey::generate(&mut rng),
        );
        let registry = VerifierRegistry::default();
        let proof = signer.generate(&pid(), &[5u8; 20], 1);

        let mut no_key = proof.clone();
        no_key.public_key = None;
        assert!(matches!(
            registry.verify(&pid(), &no_key),
            Err(VerifyError::Malformed(_))
        ));

        let mut no_sig = proof;
        no_sig.signature = None;
        assert!(matches!(
            registry.verify(&pid(), &no_sig),
            Err(VerifyError::Malformed(_))
        ));
    }

    #[test]
    fn wrong_provider_key_is_rejected() {
        let mut rng = StdRng::seed_from_u64(25);
        let signer = CspSigner::<BabyJubJub>::new(
            CensusOrigin::CspEddsaBabyJubJub,
            SigningKey::generate(&mut rng),
        );
        let imposter = SigningKey::<BabyJubJub>::generate(&mut rng);
        let registry = VerifierRegistry::default();

        // Swap in another provider's key: the root no longer matches.
        let mut proof = signer.generate(&pid(), &[5u8; 20], 1);
        proof.public_key = Some(imposter.verifying_key().to_bytes());
        assert_eq!(
            registry.verify(&pid(), &proof),
            Err(VerifyError::InvalidSignature)
        );
    }
}
