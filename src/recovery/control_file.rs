use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::buffer::PAGE_SIZE;
use crate::error::{WalError, WalResult};
use crate::recovery::lsn::{TimeLineId, MAXIMUM_ALIGNOF};
use crate::recovery::wal::codec::checkpoint::CheckpointRecord;
use crate::recovery::wal::page::XLOG_BLCKSZ;
use crate::recovery::wal::storage::write_file_durably;
use crate::recovery::Lsn;
use crate::utils::timestamp::{self, TimestampTz};

pub const CONTROL_FILE_PATH: &str = "global/pg_control";
pub const CONTROL_FILE_SIZE: usize = 8192;

pub const PG_CONTROL_VERSION: u32 = 843;
pub const CATALOG_VERSION_NO: u32 = 201_409_291;
pub const FLOAT_FORMAT: f64 = 1234567.0;
pub const RELSEG_SIZE: u32 = 131_072;
pub const NAMEDATALEN: u32 = 64;
pub const INDEX_MAX_KEYS: u32 = 32;

/// Cluster state as recorded in the control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum DbState {
    #[strum(serialize = "starting up")]
    Startup,
    #[strum(serialize = "shut down")]
    Shutdowned,
    #[strum(serialize = "shut down in recovery")]
    ShutdownedInRecovery,
    #[strum(serialize = "shutting down")]
    Shutdowning,
    #[strum(serialize = "in crash recovery")]
    InCrashRecovery,
    #[strum(serialize = "in archive recovery")]
    InArchiveRecovery,
    #[strum(serialize = "in standby mode")]
    InStandbyMode,
    #[strum(serialize = "promoted from standby")]
    InStandbyPromoted,
    #[strum(serialize = "in production")]
    InProduction,
}

impl DbState {
    /// Startup may follow any state, including one left behind by a crash.
    pub fn can_transition_to(self, next: DbState) -> bool {
        use DbState::*;
        match next {
            Startup | InCrashRecovery | InArchiveRecovery | InStandbyMode => true,
            InStandbyPromoted => matches!(self, InStandbyMode | InArchiveRecovery),
            InProduction => !matches!(self, Shutdowning | ShutdownedInRecovery),
            Shutdowning => self == InProduction,
            Shutdowned => matches!(self, Startup | Shutdowning | InProduction),
            ShutdownedInRecovery => {
                matches!(self, InCrashRecovery | InArchiveRecovery | InStandbyMode)
            }
        }
    }

    /// A run that stopped in one of these states was interrupted.
    pub fn was_interrupted(self) -> bool {
        !matches!(self, DbState::Shutdowned | DbState::ShutdownedInRecovery)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFileData {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    pub state: DbState,
    pub time: TimestampTz,
    /// Start of the latest checkpoint record.
    pub checkpoint: Lsn,
    pub prev_checkpoint: Lsn,
    pub checkpoint_copy: CheckpointRecord,
    /// Replay must reach this point before the data files are consistent.
    pub min_recovery_point: Lsn,
    pub min_recovery_point_tli: TimeLineId,
    pub backup_start_point: Lsn,
    pub backup_end_point: Lsn,
    pub backup_end_required: bool,

    pub max_align: u32,
    pub float_format: f64,
    pub blcksz: u32,
    pub relseg_size: u32,
    pub xlog_blcksz: u32,
    pub xlog_seg_size: u32,
    pub name_data_len: u32,
    pub index_max_keys: u32,
    pub enable_int_times: bool,
}

impl ControlFileData {
    pub fn new(system_identifier: u64, segment_size: u64) -> Self {
        Self {
            system_identifier,
            pg_control_version: PG_CONTROL_VERSION,
            catalog_version_no: CATALOG_VERSION_NO,
            state: DbState::Shutdowned,
            time: timestamp::now(),
            checkpoint: Lsn::INVALID,
            prev_checkpoint: Lsn::INVALID,
            checkpoint_copy: CheckpointRecord::default(),
            min_recovery_point: Lsn::INVALID,
            min_recovery_point_tli: 0,
            backup_start_point: Lsn::INVALID,
            backup_end_point: Lsn::INVALID,
            backup_end_required: false,
            max_align: MAXIMUM_ALIGNOF as u32,
            float_format: FLOAT_FORMAT,
            blcksz: PAGE_SIZE as u32,
            relseg_size: RELSEG_SIZE,
            xlog_blcksz: XLOG_BLCKSZ as u32,
            xlog_seg_size: segment_size as u32,
            name_data_len: NAMEDATALEN,
            index_max_keys: INDEX_MAX_KEYS,
            enable_int_times: true,
        }
    }

    fn encode(&self) -> WalResult<Vec<u8>> {
        let body = bincode::serialize(self)?;
        if 4 + body.len() + 4 > CONTROL_FILE_SIZE {
            return Err(WalError::Internal(format!(
                "control file body of {} bytes does not fit",
                body.len()
            )));
        }
        let mut out = Vec::with_capacity(CONTROL_FILE_SIZE);
        out.put_u32_le(body.len() as u32);
        out.put_slice(&body);
        out.put_u32_le(crc32c::crc32c(&body));
        out.resize(CONTROL_FILE_SIZE, 0);
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> WalResult<Self> {
        let mut buf = bytes;
        if buf.len() < 8 {
            return Err(WalError::Fatal("control file is truncated".to_string()));
        }
        let len = buf.get_u32_le() as usize;
        if len + 8 > bytes.len() {
            return Err(WalError::Fatal(format!(
                "control file declares a {} byte body but is {} bytes",
                len,
                bytes.len()
            )));
        }
        let body = &buf[..len];
        buf.advance(len);
        let stored = buf.get_u32_le();
        if crc32c::crc32c(body) != stored {
            return Err(WalError::Fatal(
                "incorrect checksum in control file".to_string(),
            ));
        }
        let data: ControlFileData = bincode::deserialize(body)?;
        if data.pg_control_version != PG_CONTROL_VERSION {
            return Err(WalError::Fatal(format!(
                "database files are incompatible with server: initialized with PG_CONTROL_VERSION {}, but compiled with {}",
                data.pg_control_version, PG_CONTROL_VERSION
            )));
        }
        Ok(data)
    }

    /// Compares the compile-time layout constants this build uses.
    pub fn check_compatibility(&self) -> WalResult<()> {
        fn mismatch(what: &str, stored: impl std::fmt::Display, ours: impl std::fmt::Display) -> WalError {
            WalError::Fatal(format!(
                "database files are incompatible with server: initialized with {} {}, but compiled with {} {}",
                what, stored, what, ours
            ))
        }
        if self.catalog_version_no != CATALOG_VERSION_NO {
            return Err(mismatch("CATALOG_VERSION_NO", self.catalog_version_no, CATALOG_VERSION_NO));
        }
        if self.max_align != MAXIMUM_ALIGNOF as u32 {
            return Err(mismatch("MAXALIGN", self.max_align, MAXIMUM_ALIGNOF));
        }
        if self.float_format != FLOAT_FORMAT {
            return Err(WalError::Fatal(
                "database files are incompatible with server: different floating-point number format".to_string(),
            ));
        }
        if self.blcksz != PAGE_SIZE as u32 {
            return Err(mismatch("BLCKSZ", self.blcksz, PAGE_SIZE));
        }
        if self.relseg_size != RELSEG_SIZE {
            return Err(mismatch("RELSEG_SIZE", self.relseg_size, RELSEG_SIZE));
        }
        if self.xlog_blcksz != XLOG_BLCKSZ as u32 {
            return Err(mismatch("XLOG_BLCKSZ", self.xlog_blcksz, XLOG_BLCKSZ));
        }
        crate::recovery::lsn::validate_segment_size(self.xlog_seg_size as u64)
            .map_err(|err| WalError::Fatal(err.to_string()))?;
        if self.name_data_len != NAMEDATALEN {
            return Err(mismatch("NAMEDATALEN", self.name_data_len, NAMEDATALEN));
        }
        if self.index_max_keys != INDEX_MAX_KEYS {
            return Err(mismatch("INDEX_MAX_KEYS", self.index_max_keys, INDEX_MAX_KEYS));
        }
        if !self.enable_int_times {
            return Err(WalError::Fatal(
                "database files are incompatible with server: initialized without integer datetimes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Checkpoint pointers seen at the last write, used to catch a control file
/// pointing at WAL that is not durable yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CheckpointShadow {
    checkpoint: Lsn,
    prev_checkpoint: Lsn,
    redo: Lsn,
}

impl CheckpointShadow {
    fn of(data: &ControlFileData) -> Self {
        Self {
            checkpoint: data.checkpoint,
            prev_checkpoint: data.prev_checkpoint,
            redo: data.checkpoint_copy.redo,
        }
    }
}

#[derive(Debug)]
struct ControlState {
    data: ControlFileData,
    shadow: CheckpointShadow,
}

/// Owner of `global/pg_control`. The mutex doubles as the control-file lock.
#[derive(Debug)]
pub struct ControlFileManager {
    path: PathBuf,
    inner: Mutex<ControlState>,
}

impl ControlFileManager {
    pub fn control_path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONTROL_FILE_PATH)
    }

    /// Creates the control file; it must not exist yet.
    pub fn write_initial(data_dir: &Path, data: ControlFileData) -> WalResult<Self> {
        let path = Self::control_path(data_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = data.encode()?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| {
                if err.kind() == io::ErrorKind::AlreadyExists {
                    WalError::Fatal(format!(
                        "control file \"{}\" already exists",
                        path.display()
                    ))
                } else {
                    WalError::Io(err)
                }
            })?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        debug!("created control file {}", path.display());
        Ok(Self {
            path,
            inner: Mutex::new(ControlState {
                shadow: CheckpointShadow::of(&data),
                data,
            }),
        })
    }

    /// Opens an existing control file, refusing incompatible builds.
    pub fn read(data_dir: &Path) -> WalResult<Self> {
        let path = Self::control_path(data_dir);
        let data = Self::read_data(&path)?;
        data.check_compatibility()?;
        Ok(Self {
            path,
            inner: Mutex::new(ControlState {
                shadow: CheckpointShadow::of(&data),
                data,
            }),
        })
    }

    /// Reads and validates the checksum and version only.
    pub fn read_data(path: &Path) -> WalResult<ControlFileData> {
        let bytes = fs::read(path).map_err(|err| {
            WalError::Fatal(format!(
                "could not open control file \"{}\": {}",
                path.display(),
                err
            ))
        })?;
        if bytes.len() != CONTROL_FILE_SIZE {
            return Err(WalError::Fatal(format!(
                "control file \"{}\" is {} bytes, expected {}",
                path.display(),
                bytes.len(),
                CONTROL_FILE_SIZE
            )));
        }
        ControlFileData::decode(&bytes)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> ControlFileData {
        self.inner.lock().data.clone()
    }

    pub fn state(&self) -> DbState {
        self.inner.lock().data.state
    }

    /// Applies `change` and rewrites the file. `durable_upto` is how far WAL
    /// is known to be on disk; a new checkpoint pointer beyond it is a PANIC.
    pub fn update<F>(&self, durable_upto: Lsn, change: F) -> WalResult<ControlFileData>
    where
        F: FnOnce(&mut ControlFileData),
    {
        self.apply(Some(durable_upto), change)
    }

    pub fn set_state(&self, state: DbState) -> WalResult<()> {
        let current = self.state();
        if !current.can_transition_to(state) {
            return Err(WalError::Internal(format!(
                "invalid control file state transition from \"{}\" to \"{}\"",
                current, state
            )));
        }
        self.apply(None, |data| data.state = state)?;
        Ok(())
    }

    /// Raises the minimum recovery point; never lowers it. Returns whether
    /// the file changed.
    pub fn update_min_recovery_point(&self, lsn: Lsn, tli: TimeLineId) -> WalResult<bool> {
        if self.inner.lock().data.min_recovery_point >= lsn {
            return Ok(false);
        }
        self.apply(None, |data| {
            data.min_recovery_point = lsn;
            data.min_recovery_point_tli = tli;
        })?;
        debug!("updated min recovery point to {} on timeline {}", lsn, tli);
        Ok(true)
    }

    fn apply<F>(&self, durable_upto: Option<Lsn>, change: F) -> WalResult<ControlFileData>
    where
        F: FnOnce(&mut ControlFileData),
    {
        let mut guard = self.inner.lock();
        let mut next = guard.data.clone();
        change(&mut next);
        if next.min_recovery_point < guard.data.min_recovery_point {
            next.min_recovery_point = guard.data.min_recovery_point;
            next.min_recovery_point_tli = guard.data.min_recovery_point_tli;
        }
        next.time = timestamp::now();

        let shadow = CheckpointShadow::of(&next);
        if shadow != guard.shadow {
            let durable = durable_upto.unwrap_or(Lsn::INVALID);
            if next.checkpoint > durable {
                return Err(WalError::Panic(format!(
                    "control file would point at checkpoint {} but WAL is durable only to {}",
                    next.checkpoint, durable
                )));
            }
        }

        let bytes = next.encode()?;
        write_file_durably(&self.path, &bytes).map_err(|err| {
            WalError::Panic(format!(
                "could not write control file \"{}\": {}",
                self.path.display(),
                err
            ))
        })?;
        if shadow != guard.shadow {
            info!(
                "control file now points at checkpoint {} (redo {})",
                next.checkpoint, next.checkpoint_copy.redo
            );
        }
        guard.shadow = shadow;
        guard.data = next.clone();
        Ok(next)
    }
}
