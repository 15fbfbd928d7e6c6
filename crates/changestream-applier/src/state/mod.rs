//! File-based checkpoints for resuming partitions.
//!
//! A checkpoint records, for every partition token, the range it owns and the
//! last commit timestamp it claimed. A resumed tracker refuses positions below
//! that point, so nothing already applied is replayed after a restart.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::core::Timestamp;
use crate::error::{ReplicateError, Result};
use crate::restriction::{ClaimPolicy, RangeTracker, TimestampRange};

type HmacSha256 = Hmac<Sha256>;

/// Checkpoint for a set of partitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,

    pub status: RunStatus,

    /// Per-partition progress, keyed by partition token.
    pub partitions: BTreeMap<String, PartitionCheckpoint>,

    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 over the serialized state (without this field), keyed by
    /// the config hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Partition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    Active,
    Done,
}

/// Progress of one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionCheckpoint {
    pub range: TimestampRange,
    pub last_claimed: Option<Timestamp>,
    pub status: PartitionStatus,
    #[serde(default)]
    pub applied: u64,
    #[serde(default)]
    pub dropped: u64,
    #[serde(default)]
    pub dead_lettered: u64,
    #[serde(default)]
    pub retried: u64,
}

impl PartitionCheckpoint {
    /// Fresh checkpoint for a partition with no claims.
    pub fn new(range: TimestampRange) -> Self {
        Self {
            range,
            last_claimed: None,
            status: PartitionStatus::Active,
            applied: 0,
            dropped: 0,
            dead_lettered: 0,
            retried: 0,
        }
    }
}

impl CheckpointState {
    pub fn new(config_hash: String) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            partitions: BTreeMap::new(),
            completed_at: None,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| ReplicateError::State(format!("Failed to serialize state for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| ReplicateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load a checkpoint and verify its signature.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)
            .map_err(|e| ReplicateError::State(format!("Invalid checkpoint file: {}", e)))?;

        match &state.hmac {
            Some(stored) if *stored == state.compute_hmac()? => Ok(state),
            Some(_) => Err(ReplicateError::State(
                "Checkpoint integrity check failed: HMAC mismatch (possible tampering)".to_string(),
            )),
            None => Err(ReplicateError::State(
                "Checkpoint has no HMAC signature".to_string(),
            )),
        }
    }

    /// Save the checkpoint (signed, atomic write).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ReplicateError::State(format!("Failed to serialize state: {}", e)))?;

        // Write to a temp file, then rename over the target.
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Refuse to resume under a different configuration.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(ReplicateError::ConfigChanged);
        }
        Ok(())
    }

    /// Record a partition's progress, replacing any earlier entry.
    pub fn record(&mut self, token: &str, checkpoint: PartitionCheckpoint) {
        self.partitions.insert(token.to_string(), checkpoint);
    }

    pub fn partition(&self, token: &str) -> Option<&PartitionCheckpoint> {
        self.partitions.get(token)
    }

    /// Rebuild the tracker for `token` from its checkpoint.
    ///
    /// Returns `None` when the partition has no checkpoint. A partition
    /// recorded as done comes back as a done tracker.
    pub fn tracker_for(&self, token: &str, policy: ClaimPolicy) -> Result<Option<RangeTracker>> {
        let Some(checkpoint) = self.partitions.get(token) else {
            return Ok(None);
        };
        let mut tracker = RangeTracker::resume(checkpoint.range, checkpoint.last_claimed, policy)?;
        if checkpoint.status == PartitionStatus::Done {
            tracker.mark_done();
        }
        Ok(Some(tracker))
    }

    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self) {
        self.status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}
