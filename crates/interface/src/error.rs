use thiserror::Error;

/// The error taxonomy shared by every subsystem.
///
/// Two variants deserve special handling at call sites: [`PermanentTx`]
/// means the chain rejected the transaction for good (do not retry), while
/// [`TransientTx`] means the submission should be retried, possibly against
/// a different RPC endpoint. Everything that indicates a corrupt ballot is
/// handled by dropping the ballot and releasing its locks; everything that
/// indicates system malfunction pauses the affected process and is retried
/// on restart.
///
/// [`PermanentTx`]: SequencerError::PermanentTx
/// [`TransientTx`]: SequencerError::TransientTx
#[derive(Debug, Error)]
pub enum SequencerError {
    /// The entity (process, census, key) is absent.
    #[error("not found: {0}")]
    NotFound(String),
    /// Duplicate creation of a census UUID, root or address.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The resource is currently immutable (published census, in-flight
    /// batch).
    #[error("locked: {0}")]
    Locked(String),
    /// A queue is full or an endpoint is cooling down; retry later.
    #[error("busy")]
    Busy,
    /// The ballot's vote id is already being processed.
    #[error("vote id is being processed")]
    NullifierProcessing,
    /// The ballot's address already has a ballot in flight for this process.
    #[error("address is being processed")]
    AddressProcessing,
    /// A ballot, aggregation or state-transition proof failed verification.
    #[error("invalid proof: {0}")]
    InvalidProof(String),
    /// A computed root disagrees with the expected one.
    #[error("root mismatch: expected {expected}, got {got}")]
    RootMismatch {
        /// Hex-encoded expected root.
        expected: String,
        /// Hex-encoded computed root.
        got: String,
    },
    /// The finalizer could not recover a plaintext within the declared
    /// bound.
    #[error("decryption failed within bound {0}")]
    Decryption(u64),
    /// The chain rejected the transaction permanently (e.g. a revert).
    #[error("permanent tx failure: {0}")]
    PermanentTx(String),
    /// The chain submission failed transiently; rotate the endpoint and
    /// retry.
    #[error("transient tx failure: {0}")]
    TransientTx(String),
    /// A prover job exceeded its deadline.
    #[error("job timed out")]
    JobTimeout,
    /// Worker authentication failed or a stale lease was used.
    #[error("auth rejected: {0}")]
    AuthRejected(String),
    /// The worker is banned.
    #[error("worker is banned")]
    Banned,
    /// Infrastructure failure.
    #[error("io: {0}")]
    Io(String),
    /// A bug or unclassified failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl From<scrutiny_db::DbError> for SequencerError {
    fn from(e: scrutiny_db::DbError) -> Self {
        match e {
            scrutiny_db::DbError::NotFound => SequencerError::NotFound("db key".to_string()),
            scrutiny_db::DbError::Conflict(m) => SequencerError::AlreadyExists(m),
            scrutiny_db::DbError::Io(m) => SequencerError::Io(m),
        }
    }
}

impl From<scrutiny_crypto::CryptoError> for SequencerError {
    fn from(e: scrutiny_crypto::CryptoError) -> Self {
        match e {
            scrutiny_crypto::CryptoError::InvalidSignature => {
                SequencerError::InvalidProof("invalid signature".to_string())
            }
            scrutiny_crypto::CryptoError::Malformed(m) => SequencerError::InvalidProof(m),
            scrutiny_crypto::CryptoError::Decryption(bound) => SequencerError::Decryption(bound),
            scrutiny_crypto::CryptoError::Hash(m) => SequencerError::Internal(m),
        }
    }
}

impl SequencerError {
    /// Helper for building [`SequencerError::RootMismatch`] from raw roots.
    pub fn root_mismatch(expected: &[u8], got: &[u8]) -> Self {
        SequencerError::RootMismatch {
            expected: hex::encode(expected),
            got: hex::encode(got),
        }
    }
}

/// The outcome the ingress API reports to callers. Deliberately small and
/// stable: everything else stays inside the node.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PushResult {
    /// The ballot was admitted into the pending queue.
    Accepted,
    /// The ballot was rejected; the reason is one of the ingress rules.
    Rejected {
        /// Human-readable rejection reason.
        reason: String,
    },
    /// The pending queue is over its target depth; shed load and retry.
    Busy,
}
