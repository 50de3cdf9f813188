//! The persisted key space, partitioned by short ASCII prefixes.
//!
//! Prefixes are load-bearing for crash recovery: every subsystem re-scans
//! its own prefix at startup. They must never overlap.

/// Census tree backing directories under the base path; directory name is
/// this prefix followed by the hex-encoded UUID.
pub const CENSUS_DIR: &str = "cs_";
/// Working census metadata, keyed by UUID.
pub const CENSUS_WORKING: &[u8] = b"cw_";
/// Published census metadata, keyed by root (left-trimmed of zero bytes).
pub const CENSUS_ROOT: &[u8] = b"cr_";
/// Published census metadata, keyed by organization address.
pub const CENSUS_ADDRESS: &[u8] = b"ca_";

/// Pending (not yet verified) ballots.
pub const BALLOT_PENDING: &[u8] = b"pb_";
/// Verified ballots awaiting aggregation.
pub const BALLOT_VERIFIED: &[u8] = b"vb_";
/// Aggregated batches awaiting a state transition.
pub const BATCH_AGGREGATED: &[u8] = b"ab_";
/// State transitions awaiting settlement.
pub const STATE_TRANSITION: &[u8] = b"st_";

/// Vote-id exclusion lock set.
pub const LOCK_VOTE_ID: &[u8] = b"lk_n";
/// Per-process address exclusion lock set.
pub const LOCK_ADDRESS: &[u8] = b"lk_a";

/// Process records, keyed by process id.
pub const PROCESS: &[u8] = b"pr_";
/// Per-process election state namespaces.
pub const STATE: &[u8] = b"es_";
/// Election encryption key material, keyed by process id.
pub const ELECTION_KEYS: &[u8] = b"ek_";
/// Queue bookkeeping (sequence counters).
pub const QUEUE_META: &[u8] = b"sq_";

/// Concatenates a prefix and a suffix into a full key.
pub fn key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(prefix.len() + suffix.len());
    k.extend_from_slice(prefix);
    k.extend_from_slice(suffix);
    k
}

#[cfg(test)]
mod tests {
    #[test]
    fn prefixes_do_not_shadow_each_other() {
        let all: &[&[u8]] = &[
            super::CENSUS_WORKING,
            super::CENSUS_ROOT,
            super::CENSUS_ADDRESS,
            super::BALLOT_PENDING,
            super::BALLOT_VERIFIED,
            super::BATCH_AGGREGATED,
            super::STATE_TRANSITION,
            super::LOCK_VOTE_ID,
            super::LOCK_ADDRESS,
            super::PROCESS,
            super::STATE,
            super::ELECTION_KEYS,
            super::QUEUE_META,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j {
                    assert!(!a.starts_with(b), "{a:?} shadowed by {b:?}");
                }
            }
        }
    }
}
