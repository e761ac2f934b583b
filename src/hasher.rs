//! Statistics digest using Blake3

use blake3::Hasher as Blake3Hasher;
use crate::error::SerializationError;
use crate::statistics::Statistics;
use crate::types::StatsDigest;

/// Hashes the canonical bincode encoding of a run's [`Statistics`].
///
/// Two replays of the same trace against equally-behaving live allocators
/// produce the same digest; timing is not part of the statistics.
#[derive(Debug, Clone, Default)]
pub struct StatisticsHasher;

impl StatisticsHasher {
    pub fn new() -> Self {
        Self
    }

    pub fn hash(&self, statistics: &Statistics) -> Result<StatsDigest, SerializationError> {
        let serialized =
            bincode::serialize(statistics).map_err(|e| SerializationError::SerializationFailed {
                reason: format!("Statistics encoding failed: {}", e),
            })?;

        let mut hasher = Blake3Hasher::new();
        hasher.update(&serialized);
        Ok(StatsDigest(*hasher.finalize().as_bytes()))
    }

    /// Fold the digests of several iterations into one
    pub fn hash_chain(&self, digests: &[StatsDigest]) -> StatsDigest {
        let mut hasher = Blake3Hasher::new();
        for digest in digests {
            hasher.update(&digest.0);
        }
        StatsDigest(*hasher.finalize().as_bytes())
    }
}
