mod recovery;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{WalError, WalResult};
use crate::recovery::lsn::{validate_segment_size, DEFAULT_WAL_SEGMENT_SIZE};
use crate::recovery::RmgrId;

pub use recovery::{
    RecoveryConfig, RecoveryTarget, TargetTimeline, RECOVERY_CONFIG_FILE, RECOVERY_DONE_FILE,
};

#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Only used when initializing a data directory; an existing cluster
    /// always uses the size recorded in its control file.
    pub segment_size: u64,
    /// Number of WAL pages held in the shared ring buffer.
    pub wal_buffers: usize,
    pub full_page_writes: bool,
    /// fsync segments when flushing. Disabling trades durability for speed.
    pub fsync: bool,
    pub synchronous_commit: bool,
    /// Background writer delay; `None` disables the WAL writer worker.
    pub writer_interval: Option<Duration>,
    /// Segments kept behind the current position; non-positive disables.
    pub keep_segments: i64,
    pub max_replication_slots: usize,
    /// Resource managers whose records carry verification page images.
    pub consistency_checking: Vec<RmgrId>,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            segment_size: DEFAULT_WAL_SEGMENT_SIZE,
            wal_buffers: 64,
            full_page_writes: true,
            fsync: true,
            synchronous_commit: true,
            writer_interval: Some(Duration::from_millis(200)),
            keep_segments: 0,
            max_replication_slots: 0,
            consistency_checking: Vec::new(),
        }
    }
}

impl WalConfig {
    pub fn validate(&self) -> WalResult<()> {
        validate_segment_size(self.segment_size)?;
        if self.wal_buffers < 4 {
            return Err(WalError::InvalidConfig(format!(
                "wal_buffers must be at least 4, got {}",
                self.wal_buffers
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CheckpointConfig {
    /// Time-driven checkpoints; `None` disables the checkpointer worker.
    pub timeout: Option<Duration>,
    /// Completed segments since the last redo point that trigger a checkpoint.
    pub checkpoint_segments: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            timeout: Some(Duration::from_secs(300)),
            checkpoint_segments: 3,
        }
    }
}

impl CheckpointConfig {
    /// Spare segments that may be kept as recycled future segments.
    pub fn recycle_slop(&self) -> u64 {
        2 * self.checkpoint_segments + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveTarget {
    Directory(PathBuf),
    /// Shell command with `%p` (segment path) and `%f` (file name) placeholders.
    Command(String),
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveConfig {
    pub mode: bool,
    pub target: Option<ArchiveTarget>,
    /// Force a segment switch when this long has passed since the last one.
    pub timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
}

impl ArchiveConfig {
    pub fn archiving_active(&self) -> bool {
        self.mode
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub bgwriter_interval: Option<Duration>,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            bgwriter_interval: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseOptions {
    pub wal: WalConfig,
    pub checkpoint: CheckpointConfig,
    pub archive: ArchiveConfig,
    pub buffer_pool: BufferPoolConfig,
    /// Overrides `recovery.conf` in the data directory when set.
    pub recovery: Option<RecoveryConfig>,
}

impl DatabaseOptions {
    /// Options suited to tests: small segments, no background timers.
    pub fn for_testing(segment_size: u64) -> Self {
        DatabaseOptions {
            wal: WalConfig {
                segment_size,
                wal_buffers: 8,
                fsync: false,
                writer_interval: None,
                ..WalConfig::default()
            },
            checkpoint: CheckpointConfig {
                timeout: None,
                checkpoint_segments: 3,
            },
            ..DatabaseOptions::default()
        }
    }
}
