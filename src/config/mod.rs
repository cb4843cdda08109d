//! Tunables for the consensus engine. All fields have working defaults so
//! `RaftConfig::default()` is a valid configuration; loaded configs are
//! checked with [`RaftConfig::validate`] before a node starts.

use std::time::Duration;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::RaftError;
use crate::errors::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Lower bound of the randomized follower election timeout (milliseconds).
    /// Also the window of the leader-stickiness check: votes are rejected
    /// while an append from a live leader arrived within this duration.
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    /// Upper bound of the randomized follower election timeout (milliseconds).
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// Period between leader heartbeat broadcasts (milliseconds).
    #[serde(default = "default_leader_heartbeat_period_ms")]
    pub leader_heartbeat_period_ms: u64,

    /// How long a leader keeps counting a follower as responsive after its
    /// last response (milliseconds). Unresponsive followers are not
    /// advertised as snapshot chunk sources.
    #[serde(default = "default_leader_heartbeat_timeout_ms")]
    pub leader_heartbeat_timeout_ms: u64,

    /// Maximum number of log entries carried by one append request.
    #[serde(default = "default_append_entries_request_batch_size")]
    pub append_entries_request_batch_size: u64,

    /// A snapshot is taken every this many applied entries.
    #[serde(default = "default_commit_count_to_take_snapshot")]
    pub commit_count_to_take_snapshot: u64,

    /// Maximum number of uncommitted entries a leader accepts before
    /// rejecting new operations. The last free slot is reserved for a
    /// membership change so reconfiguration cannot be starved out.
    #[serde(default = "default_max_uncommitted_log_entry_count")]
    pub max_uncommitted_log_entry_count: u64,

    /// Size of one snapshot chunk in bytes.
    #[serde(default = "default_snapshot_chunk_size_bytes")]
    pub snapshot_chunk_size_bytes: u64,

    /// When enabled, a follower installing a snapshot pulls chunks from
    /// peers that already hold it instead of loading only the leader.
    #[serde(default = "default_transfer_snapshots_from_followers")]
    pub transfer_snapshots_from_followers: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            leader_heartbeat_period_ms: default_leader_heartbeat_period_ms(),
            leader_heartbeat_timeout_ms: default_leader_heartbeat_timeout_ms(),
            append_entries_request_batch_size: default_append_entries_request_batch_size(),
            commit_count_to_take_snapshot: default_commit_count_to_take_snapshot(),
            max_uncommitted_log_entry_count: default_max_uncommitted_log_entry_count(),
            snapshot_chunk_size_bytes: default_snapshot_chunk_size_bytes(),
            transfer_snapshots_from_followers: default_transfer_snapshots_from_followers(),
        }
    }
}

impl RaftConfig {
    /// Loads configuration from an optional TOML file overlaid with
    /// `RAFT_`-prefixed environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        let cfg: RaftConfig = builder
            .add_source(Environment::with_prefix("RAFT").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0 {
            return Err(RaftError::Config(ConfigError::Message(
                "election_timeout_min_ms must be greater than 0".into(),
            )));
        }
        if self.election_timeout_max_ms < self.election_timeout_min_ms {
            return Err(RaftError::Config(ConfigError::Message(
                "election_timeout_max_ms must not be below election_timeout_min_ms".into(),
            )));
        }
        if self.leader_heartbeat_period_ms == 0 {
            return Err(RaftError::Config(ConfigError::Message(
                "leader_heartbeat_period_ms must be greater than 0".into(),
            )));
        }
        if self.leader_heartbeat_period_ms >= self.election_timeout_min_ms {
            return Err(RaftError::Config(ConfigError::Message(
                "leader_heartbeat_period_ms must be below election_timeout_min_ms".into(),
            )));
        }
        if self.leader_heartbeat_timeout_ms < self.leader_heartbeat_period_ms {
            return Err(RaftError::Config(ConfigError::Message(
                "leader_heartbeat_timeout_ms must cover at least one heartbeat period".into(),
            )));
        }
        if self.append_entries_request_batch_size == 0 {
            return Err(RaftError::Config(ConfigError::Message(
                "append_entries_request_batch_size must be greater than 0".into(),
            )));
        }
        if self.commit_count_to_take_snapshot == 0 {
            return Err(RaftError::Config(ConfigError::Message(
                "commit_count_to_take_snapshot must be greater than 0".into(),
            )));
        }
        if self.max_uncommitted_log_entry_count < 2 {
            // one slot for normal entries plus the reserved membership slot
            return Err(RaftError::Config(ConfigError::Message(
                "max_uncommitted_log_entry_count must be at least 2".into(),
            )));
        }
        if self.snapshot_chunk_size_bytes == 0 {
            return Err(RaftError::Config(ConfigError::Message(
                "snapshot_chunk_size_bytes must be greater than 0".into(),
            )));
        }
        Ok(())
    }

    pub fn leader_heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.leader_heartbeat_period_ms)
    }

    pub fn leader_heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_heartbeat_timeout_ms)
    }

    pub fn leader_stickiness_window(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    /// Number of log entries kept behind a snapshot so slightly lagging
    /// followers can still be repaired from the log.
    pub fn log_tail_to_keep(&self) -> u64 {
        self.commit_count_to_take_snapshot / 10
    }
}

fn default_election_timeout_min_ms() -> u64 {
    1_000
}
fn default_election_timeout_max_ms() -> u64 {
    2_000
}
fn default_leader_heartbeat_period_ms() -> u64 {
    500
}
fn default_leader_heartbeat_timeout_ms() -> u64 {
    5_000
}
fn default_append_entries_request_batch_size() -> u64 {
    512
}
fn default_commit_count_to_take_snapshot() -> u64 {
    50_000
}
fn default_max_uncommitted_log_entry_count() -> u64 {
    5_000
}
fn default_snapshot_chunk_size_bytes() -> u64 {
    // 4 MiB
    4 * 1024 * 1024
}
fn default_transfer_snapshots_from_followers() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_election_timeout_range() {
        let cfg = RaftConfig {
            election_timeout_min_ms: 2_000,
            election_timeout_max_ms: 1_000,
            ..RaftConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_period_at_or_above_election_floor() {
        let cfg = RaftConfig {
            election_timeout_min_ms: 500,
            leader_heartbeat_period_ms: 500,
            ..RaftConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_applies_defaults_without_sources() {
        let cfg = RaftConfig::load(None).unwrap();
        assert_eq!(cfg.election_timeout_min_ms, 1_000);
        assert!(cfg.transfer_snapshots_from_followers);
    }
}
