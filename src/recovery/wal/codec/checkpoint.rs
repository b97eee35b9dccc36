use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{WalError, WalResult};
use crate::recovery::lsn::TimeLineId;
use crate::recovery::Lsn;
use crate::transaction::{Oid, TransactionId};
use crate::utils::timestamp::TimestampTz;

pub const XLOG_CHECKPOINT_SHUTDOWN: u8 = 0x00;
pub const XLOG_CHECKPOINT_ONLINE: u8 = 0x10;
pub const XLOG_NOOP: u8 = 0x20;
pub const XLOG_NEXTOID: u8 = 0x30;
pub const XLOG_SWITCH: u8 = 0x40;
pub const XLOG_BACKUP_END: u8 = 0x50;
pub const XLOG_RESTORE_POINT: u8 = 0x70;
pub const XLOG_FPW_CHANGE: u8 = 0x80;
pub const XLOG_END_OF_RECOVERY: u8 = 0x90;
pub const XLOG_FPI: u8 = 0xA0;

pub const CHECKPOINT_RECORD_SIZE: usize = 8 + 4 + 4 + 4 + 9 * 4 + 8;
const PREPARED_ENTRY_SIZE: usize = 16;

/// Counters and positions captured by a checkpoint. A copy also lives in the
/// control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub redo: Lsn,
    pub this_tli: TimeLineId,
    pub prev_tli: TimeLineId,
    pub full_page_writes: bool,
    pub next_xid_epoch: u32,
    pub next_xid: TransactionId,
    pub next_oid: Oid,
    pub next_relfilenode: Oid,
    pub next_multi: u32,
    pub next_multi_offset: u32,
    pub oldest_xid: TransactionId,
    pub oldest_xid_db: Oid,
    pub oldest_active_xid: TransactionId,
    pub time: TimestampTz,
}

/// A prepared transaction still waiting for its commit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedXactEntry {
    pub xid: TransactionId,
    pub prepare_lsn: Lsn,
}

/// Checkpoint record body: the fixed part followed by the prepared
/// transaction extension.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointBody {
    pub checkpoint: CheckpointRecord,
    pub prepared: Vec<PreparedXactEntry>,
}

impl CheckpointRecord {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.redo.as_u64());
        buf.put_u32_le(self.this_tli);
        buf.put_u32_le(self.prev_tli);
        buf.put_u8(self.full_page_writes as u8);
        buf.put_bytes(0, 3);
        buf.put_u32_le(self.next_xid_epoch);
        buf.put_u32_le(self.next_xid);
        buf.put_u32_le(self.next_oid);
        buf.put_u32_le(self.next_relfilenode);
        buf.put_u32_le(self.next_multi);
        buf.put_u32_le(self.next_multi_offset);
        buf.put_u32_le(self.oldest_xid);
        buf.put_u32_le(self.oldest_xid_db);
        buf.put_u32_le(self.oldest_active_xid);
        buf.put_i64_le(self.time);
    }

    pub fn decode(mut bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < CHECKPOINT_RECORD_SIZE {
            return Err(WalError::Corrupt(format!(
                "checkpoint record is {} bytes, expected at least {}",
                bytes.len(),
                CHECKPOINT_RECORD_SIZE
            )));
        }
        let redo = Lsn::new(bytes.get_u64_le());
        let this_tli = bytes.get_u32_le();
        let prev_tli = bytes.get_u32_le();
        let full_page_writes = bytes.get_u8() != 0;
        bytes.advance(3);
        Ok(Self {
            redo,
            this_tli,
            prev_tli,
            full_page_writes,
            next_xid_epoch: bytes.get_u32_le(),
            next_xid: bytes.get_u32_le(),
            next_oid: bytes.get_u32_le(),
            next_relfilenode: bytes.get_u32_le(),
            next_multi: bytes.get_u32_le(),
            next_multi_offset: bytes.get_u32_le(),
            oldest_xid: bytes.get_u32_le(),
            oldest_xid_db: bytes.get_u32_le(),
            oldest_active_xid: bytes.get_u32_le(),
            time: bytes.get_i64_le(),
        })
    }
}

impl CheckpointBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            CHECKPOINT_RECORD_SIZE + 4 + self.prepared.len() * PREPARED_ENTRY_SIZE,
        );
        self.checkpoint.encode(&mut buf);
        if !self.prepared.is_empty() {
            buf.put_u32_le(self.prepared.len() as u32);
            buf.put_u32_le(0);
            for entry in &self.prepared {
                buf.put_u32_le(entry.xid);
                buf.put_u32_le(0);
                buf.put_u64_le(entry.prepare_lsn.as_u64());
            }
        }
        buf
    }

    /// A body of exactly the fixed size carries no extension (bootstrap and
    /// idle checkpoints).
    pub fn decode(bytes: &[u8]) -> WalResult<Self> {
        let checkpoint = CheckpointRecord::decode(bytes)?;
        let mut rest = &bytes[CHECKPOINT_RECORD_SIZE..];
        let mut prepared = Vec::new();
        if !rest.is_empty() {
            if rest.len() < 8 {
                return Err(WalError::Corrupt(
                    "checkpoint extension header truncated".to_string(),
                ));
            }
            let count = rest.get_u32_le() as usize;
            rest.advance(4);
            if rest.len() != count * PREPARED_ENTRY_SIZE {
                return Err(WalError::Corrupt(format!(
                    "checkpoint extension declares {} prepared transactions but has {} bytes",
                    count,
                    rest.len()
                )));
            }
            for _ in 0..count {
                let xid = rest.get_u32_le();
                rest.advance(4);
                prepared.push(PreparedXactEntry {
                    xid,
                    prepare_lsn: Lsn::new(rest.get_u64_le()),
                });
            }
        }
        Ok(Self {
            checkpoint,
            prepared,
        })
    }
}

pub fn encode_next_oid(oid: Oid) -> Vec<u8> {
    oid.to_le_bytes().to_vec()
}

pub fn decode_next_oid(mut bytes: &[u8]) -> WalResult<Oid> {
    if bytes.len() != 4 {
        return Err(WalError::Corrupt("bad next-OID record".to_string()));
    }
    Ok(bytes.get_u32_le())
}

pub fn encode_backup_end(start: Lsn) -> Vec<u8> {
    start.as_u64().to_le_bytes().to_vec()
}

pub fn decode_backup_end(mut bytes: &[u8]) -> WalResult<Lsn> {
    if bytes.len() != 8 {
        return Err(WalError::Corrupt("bad backup-end record".to_string()));
    }
    Ok(Lsn::new(bytes.get_u64_le()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePoint {
    pub time: TimestampTz,
    pub name: String,
}

/// Restore point names share the limit of file names in the archive.
pub const MAX_RESTORE_POINT_NAME: usize = 63;

impl RestorePoint {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.name.len());
        buf.put_i64_le(self.time);
        buf.extend_from_slice(self.name.as_bytes());
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < 8 {
            return Err(WalError::Corrupt("bad restore point record".to_string()));
        }
        let time = bytes.get_i64_le();
        let name = String::from_utf8(bytes.to_vec())
            .map_err(|_| WalError::Corrupt("restore point name is not UTF-8".to_string()))?;
        Ok(Self { time, name })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfRecovery {
    pub time: TimestampTz,
    pub this_tli: TimeLineId,
    pub prev_tli: TimeLineId,
}

impl EndOfRecovery {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.put_i64_le(self.time);
        buf.put_u32_le(self.this_tli);
        buf.put_u32_le(self.prev_tli);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() != 16 {
            return Err(WalError::Corrupt("bad end-of-recovery record".to_string()));
        }
        Ok(Self {
            time: bytes.get_i64_le(),
            this_tli: bytes.get_u32_le(),
            prev_tli: bytes.get_u32_le(),
        })
    }
}

pub fn decode_fpw_change(bytes: &[u8]) -> WalResult<bool> {
    match bytes {
        [flag] => Ok(*flag != 0),
        _ => Err(WalError::Corrupt("bad full_page_writes change record".to_string())),
    }
}
