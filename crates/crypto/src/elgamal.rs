//! Exponential ElGamal on the BabyJubJub twisted-Edwards curve.
//!
//! Ballot fields are encrypted as `(k·G, m·G + k·PK)`. Ciphertexts add
//! pointwise, which is what makes the per-field accumulators homomorphic:
//! the tally layer only ever adds and subtracts ciphertexts, and the
//! finalizer recovers the plaintext sum with a baby-step/giant-step search.
//!
//! BabyJubJub's base field is the BN254 scalar field, so affine coordinates
//! feed straight into Poseidon when ciphertexts are hashed for the circuits.

use ark_bn254::Fr as BaseField;
use ark_ec::twisted_edwards::Projective;
use ark_ec::{AffineRepr, CurveGroup, Group};
use ark_ed_on_bn254::{EdwardsAffine, EdwardsConfig, Fr as ScalarField};
use ark_ff::{PrimeField, UniformRand, Zero};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use rand::{CryptoRng, RngCore};
use std::collections::HashMap;

use crate::CryptoError;

type Point = Projective<EdwardsConfig>;

/// Fallback discrete-log bound when a process declares no usable
/// `max_value × max_voters` product.
pub const DEFAULT_DECRYPT_BOUND: u64 = 1 << 24;

/// An ElGamal encryption key (public curve point).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(pub EdwardsAffine);

/// The matching decryption key.
#[derive(Clone, Debug)]
pub struct SecretKey(ScalarField);

impl SecretKey {
    /// Canonical scalar encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.0
            .serialize_compressed(&mut out)
            .expect("field serialization is infallible");
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        ScalarField::deserialize_compressed(bytes)
            .map(SecretKey)
            .map_err(|e| CryptoError::Malformed(format!("secret key: {e}")))
    }
}

/// A key pair for one election.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = ScalarField::rand(rng);
        let public = (Point::generator() * secret).into_affine();
        Self {
            public: PublicKey(public),
            secret: SecretKey(secret),
        }
    }
}

impl PublicKey {
    /// Compressed 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; 32] {
        point_to_bytes(&self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        point_from_bytes(bytes).map(PublicKey)
    }

    /// Affine coordinates as BN254 scalar field elements, the form the
    /// circuits consume.
    pub fn coords(&self) -> (BaseField, BaseField) {
        (self.0.x, self.0.y)
    }
}

/// One encrypted ballot field: a pair of curve points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ciphertext {
    pub c1: EdwardsAffine,
    pub c2: EdwardsAffine,
}

impl Ciphertext {
    /// The additive identity: an encryption of zero with zero randomness.
    /// Accumulators start here.
    pub fn zero() -> Self {
        let identity = Point::zero().into_affine();
        Self {
            c1: identity,
            c2: identity,
        }
    }

    /// Homomorphic addition.
    pub fn add(&self, other: &Ciphertext) -> Ciphertext {
        Ciphertext {
            c1: (self.c1.into_group() + other.c1).into_affine(),
            c2: (self.c2.into_group() + other.c2).into_affine(),
        }
    }

    /// Homomorphic subtraction.
    pub fn sub(&self, other: &Ciphertext) -> Ciphertext {
        Ciphertext {
            c1: (self.c1.into_group() - other.c1.into_group()).into_affine(),
            c2: (self.c2.into_group() - other.c2.into_group()).into_affine(),
        }
    }

    /// 64-byte encoding: compressed c1 then compressed c2.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&point_to_bytes(&self.c1));
        out[32..].copy_from_slice(&point_to_bytes(&self.c2));
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 64 {
            return Err(CryptoError::Malformed(format!(
                "ciphertext must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            c1: point_from_bytes(&bytes[..32])?,
            c2: point_from_bytes(&bytes[32..])?,
        })
    }

    /// Affine coordinates `(c1.x, c1.y, c2.x, c2.y)` for circuit hashing.
    pub fn coords(&self) -> [BaseField; 4] {
        [self.c1.x, self.c1.y, self.c2.x, self.c2.y]
    }
}

/// Encrypts a small plaintext scalar under `pk`.
pub fn encrypt<R: RngCore + CryptoRng>(
    message: u64,
    pk: &PublicKey,
    rng: &mut R,
) -> Ciphertext {
    let k = ScalarField::rand(rng);
    let c1 = Point::generator() * k;
    let c2 = Point::generator() * ScalarField::from(message) + pk.0.into_group() * k;
    Ciphertext {
        c1: c1.into_affine(),
        c2: c2.into_affine(),
    }
}

/// Decrypts a ciphertext whose plaintext is known to lie in `0..=bound`,
/// using baby-step/giant-step over the message point.
pub fn decrypt(ct: &Ciphertext, sk: &SecretKey, bound: u64) -> Result<u64, CryptoError> {
    let message_point = ct.c2.into_group() - ct.c1.into_group() * sk.0;
    discrete_log(&message_point, bound)
}

/// Solves `target = m·G` for `m ∈ 0..=bound`.
fn discrete_log(target: &Point, bound: u64) -> Result<u64, CryptoError> {
    if target.is_zero() {
        return Ok(0);
    }
    let n = isqrt(bound) + 1;

    // Baby steps: j ↦ j·G.
    let mut table: HashMap<[u8; 32], u64> = HashMap::with_capacity(n as usize);
    let g = Point::generator();
    let mut step = Point::zero();
    for j in 0..n {
        table.insert(point_to_bytes(&step.into_affine()), j);
        step += g;
    }

    // Giant steps: target - i·(n·G) against the table.
    let giant = g * ScalarField::from(n);
    let mut gamma = *target;
    let mut i = 0u64;
    while i * n <= bound {
        if let Some(j) = table.get(&point_to_bytes(&gamma.into_affine())) {
            let m = i * n + j;
            if m <= bound {
                return Ok(m);
            }
        }
        gamma -= giant;
        i += 1;
    }
    Err(CryptoError::Decryption(bound))
}

fn isqrt(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let mut lo = 1u64;
    let mut hi = 1u64 << 32;
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if mid.checked_mul(mid).map(|sq| sq <= n).unwrap_or(false) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

pub(crate) fn point_to_bytes(p: &EdwardsAffine) -> [u8; 32] {
    let mut out = [0u8; 32];
    p.serialize_compressed(&mut out[..])
        .expect("32 bytes is the compressed size of a BabyJubJub point");
    out
}

pub(crate) fn point_from_bytes(bytes: &[u8]) -> Result<EdwardsAffine, CryptoError> {
    EdwardsAffine::deserialize_compressed(bytes)
        .map_err(|e| CryptoError::Malformed(format!("curve point: {e}")))
}

/// Reduces arbitrary big-endian bytes into the BabyJubJub scalar field.
pub fn scalar_from_be_bytes(bytes: &[u8]) -> ScalarField {
    ScalarField::from_be_bytes_mod_order(bytes)
}
