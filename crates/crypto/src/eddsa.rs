//! Schnorr-style EdDSA over arkworks twisted-Edwards curves.
//!
//! Credential service providers certify voter eligibility by signing the
//! (process, address, weight) digest. Deployments exist on more than one
//! curve, so the scheme is generic over [`TECurveConfig`]; each census
//! origin instantiates it with its own curve and domain tag.
//!
//! The verification equation is `s·G = R + c·A` with the challenge
//! `c = H(domain ‖ R ‖ A ‖ msg)` reduced into the curve's scalar field.

use ark_ec::twisted_edwards::{Affine, Projective, TECurveConfig};
use ark_ec::{AffineRepr, CurveGroup, Group};
use ark_ff::{PrimeField, UniformRand, Zero};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};

use crate::CryptoError;

/// A CSP signing key.
#[derive(Clone, Debug)]
pub struct SigningKey<P: TECurveConfig> {
    scalar: P::ScalarField,
    public: Affine<P>,
}

/// A CSP verification key. Its compressed encoding doubles as the census
/// root for signature-based censuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyingKey<P: TECurveConfig>(pub Affine<P>);

/// A detached signature: the commitment point and the response scalar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature<P: TECurveConfig> {
    pub r: Affine<P>,
    pub s: P::ScalarField,
}

impl<P: TECurveConfig> SigningKey<P> {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let scalar = P::ScalarField::rand(rng);
        let public = (Projective::<P>::generator() * scalar).into_affine();
        Self { scalar, public }
    }

    pub fn verifying_key(&self) -> VerifyingKey<P> {
        VerifyingKey(self.public)
    }

    /// Signs `message` under `domain`. The nonce is derived
    /// deterministically from the key and message.
    pub fn sign(&self, domain: &[u8], message: &[u8]) -> Signature<P> {
        let mut scalar_bytes = Vec::new();
        self.scalar
            .serialize_compressed(&mut scalar_bytes)
            .expect("field serialization is infallible");

        let nonce = hash_to_scalar::<P>(&[b"nonce", domain, &scalar_bytes, message]);
        let r = (Projective::<P>::generator() * nonce).into_affine();
        let c = challenge::<P>(domain, &r, &self.public, message);
        let s = nonce + c * self.scalar;
        Signature { r, s }
    }
}

impl<P: TECurveConfig> VerifyingKey<P> {
    /// Compressed point encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.0
            .serialize_compressed(&mut out)
            .expect("point serialization is infallible");
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Affine::<P>::deserialize_compressed(bytes)
            .map(VerifyingKey)
            .map_err(|e| CryptoError::Malformed(format!("verifying key: {e}")))
    }

    /// Checks `sig` over `message` under `domain`.
    pub fn verify(
        &self,
        domain: &[u8],
        message: &[u8],
        sig: &Signature<P>,
    ) -> Result<(), CryptoError> {
        let c = challenge::<P>(domain, &sig.r, &self.0, message);
        let lhs = Projective::<P>::generator() * sig.s;
        let rhs = sig.r.into_group() + self.0.into_group() * c;
        if (lhs - rhs).is_zero() {
            Ok(())
        } else {
            Err(CryptoError::InvalidSignature)
        }
    }
}

impl<P: TECurveConfig> Signature<P> {
    /// Encoding: compressed `r` followed by the compressed response scalar.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.r
            .serialize_compressed(&mut out)
            .expect("point serialization is infallible");
        self.s
            .serialize_compressed(&mut out)
            .expect("field serialization is infallible");
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let point_len = point_size::<P>();
        if bytes.len() <= point_len {
            return Err(CryptoError::Malformed(format!(
                "signature too short: {} bytes",
                bytes.len()
            )));
        }
        let r = Affine::<P>::deserialize_compressed(&bytes[..point_len])
            .map_err(|e| CryptoError::Malformed(format!("signature r: {e}")))?;
        let s = P::ScalarField::deserialize_compressed(&bytes[point_len..])
            .map_err(|e| CryptoError::Malformed(format!("signature s: {e}")))?;
        Ok(Self { r, s })
    }
}

fn point_size<P: TECurveConfig>() -> usize {
    Affine::<P>::generator().compressed_size()
}

fn challenge<P: TECurveConfig>(
    domain: &[u8],
    r: &Affine<P>,
    a: &Affine<P>,
    message: &[u8],
) -> P::ScalarField {
    let mut r_bytes = Vec::new();
    r.serialize_compressed(&mut r_bytes)
        .expect("point serialization is infallible");
    let mut a_bytes = Vec::new();
    a.serialize_compressed(&mut a_bytes)
        .expect("point serialization is infallible");
    hash_to_scalar::<P>(&[b"challenge", domain, &r_bytes, &a_bytes, message])
}

fn hash_to_scalar<P: TECurveConfig>(parts: &[&[u8]]) -> P::ScalarField {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    P::ScalarField::from_be_bytes_mod_order(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    type BabyJubJub = ark_ed_on_bn254::EdwardsConfig;
    type EdBls377 = ark_ed_on_bls12_377::EdwardsConfig;

    #[test]
    fn sign_verify_roundtrip_on_both_curves() {
        let mut rng = StdRng::seed_from_u64(11);

        let key = SigningKey::<BabyJubJub>::generate(&mut rng);
        let sig = key.sign(b"test", b"hello");
        key.verifying_key().verify(b"test", b"hello", &sig).unwrap();

        let key = SigningKey::<EdBls377>::generate(&mut rng);
        let sig = key.sign(b"test", b"hello");
        key.verifying_key().verify(b"test", b"hello", &sig).unwrap();
    }

    #[test]
    fn tampered_message_or_domain_fails() {
        let mut rng = StdRng::seed_from_u64(12);
        let key = SigningKey::<BabyJubJub>::generate(&mut rng);
        let sig = key.sign(b"domain-a", b"hello");
        let vk = key.verifying_key();

        assert!(vk.verify(b"domain-a", b"hullo", &sig).is_err());
        assert!(vk.verify(b"domain-b", b"hello", &sig).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let mut rng = StdRng::seed_from_u64(13);
        let key = SigningKey::<BabyJubJub>::generate(&mut rng);
        let other = SigningKey::<BabyJubJub>::generate(&mut rng);
        let sig = key.sign(b"d", b"m");
        assert!(other.verifying_key().verify(b"d", b"m", &sig).is_err());
    }

    #[test]
    fn signature_bytes_roundtrip() {
        let mut rng = StdRng::seed_from_u64(14);
        let key = SigningKey::<BabyJubJub>::generate(&mut rng);
        let sig = key.sign(b"d", b"m");
        let decoded = Signature::<BabyJubJub>::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(sig, decoded);
        key.verifying_key().verify(b"d", b"m", &decoded).unwrap();

        assert!(Signature::<BabyJubJub>::from_bytes(&[1u8; 4]).is_err());
    }

    #[test]
    fn verifying_key_bytes_roundtrip() {
        let mut rng = StdRng::seed_from_u64(15);
        let key = SigningKey::<EdBls377>::generate(&mut rng);
        let vk = key.verifying_key();
        let decoded = VerifyingKey::<EdBls377>::from_bytes(&vk.to_bytes()).unwrap();
        assert_eq!(vk, decoded);
    }
}
