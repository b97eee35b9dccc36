use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::buffer::page::mask_page_lsn_and_checksum;
use crate::buffer::BufferManager;
use crate::error::{WalError, WalResult};
use crate::recovery::wal::codec::checkpoint::{
    decode_backup_end, decode_fpw_change, decode_next_oid, CheckpointBody, EndOfRecovery,
    RestorePoint, XLOG_BACKUP_END, XLOG_CHECKPOINT_ONLINE, XLOG_CHECKPOINT_SHUTDOWN,
    XLOG_END_OF_RECOVERY, XLOG_FPI, XLOG_FPW_CHANGE, XLOG_NEXTOID, XLOG_NOOP,
    XLOG_RESTORE_POINT, XLOG_SWITCH,
};
use crate::recovery::wal::codec::DecodedRecord;
use crate::recovery::WalManager;
use crate::storage::heap::HeapResourceManager;
use crate::transaction::xact::XactResourceManager;
use crate::transaction::TransactionManager;
use crate::utils::timestamp::format_timestamptz;

/// Resource manager ids as stored in the record header.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[repr(u8)]
pub enum RmgrId {
    #[strum(serialize = "XLOG")]
    Xlog = 0,
    #[strum(serialize = "Transaction")]
    Xact = 1,
    #[strum(serialize = "Heap")]
    Heap = 2,
}

impl TryFrom<u8> for RmgrId {
    type Error = WalError;

    fn try_from(value: u8) -> WalResult<Self> {
        match value {
            0 => Ok(RmgrId::Xlog),
            1 => Ok(RmgrId::Xact),
            2 => Ok(RmgrId::Heap),
            other => Err(WalError::Corrupt(format!(
                "invalid resource manager ID {}",
                other
            ))),
        }
    }
}

/// What a redo callback may touch.
pub struct RedoContext<'a> {
    pub buffers: &'a Arc<BufferManager>,
    pub xacts: &'a TransactionManager,
    pub wal: &'a WalManager,
}

/// Per-rmgr callbacks used by replay, consistency checking and dumps.
pub trait ResourceManager: Send + Sync {
    fn id(&self) -> RmgrId;

    /// Replays `record`. Blocks restored from full-page images have already
    /// been written to their buffers and must be left alone.
    fn redo(&self, record: &DecodedRecord, ctx: &RedoContext<'_>) -> WalResult<()>;

    /// Name of the record kind encoded in the rmgr bits of `info`.
    fn identify(&self, info: u8) -> Option<&'static str>;

    fn desc(&self, record: &DecodedRecord) -> WalResult<String>;

    /// Clears bits of a page that may legitimately differ between the replayed
    /// page and its logged image.
    fn mask(&self, page: &mut [u8]) {
        mask_page_lsn_and_checksum(page);
    }

    /// Whether replay may be restarted from a checkpoint seen right now.
    fn safe_restartpoint(&self) -> bool {
        true
    }
}

static XLOG_RMGR: XlogResourceManager = XlogResourceManager;
static XACT_RMGR: XactResourceManager = XactResourceManager;
static HEAP_RMGR: HeapResourceManager = HeapResourceManager;

pub fn resource_manager(id: RmgrId) -> &'static dyn ResourceManager {
    match id {
        RmgrId::Xlog => &XLOG_RMGR,
        RmgrId::Xact => &XACT_RMGR,
        RmgrId::Heap => &HEAP_RMGR,
    }
}

/// True when every resource manager agrees replay may restart here.
pub fn all_safe_restartpoint() -> bool {
    RmgrId::iter().all(|id| resource_manager(id).safe_restartpoint())
}

/// One-line rendering in the form `<rmgr> <identify>: <desc>`.
pub fn describe_record(record: &DecodedRecord) -> String {
    let rmgr = resource_manager(record.rmid);
    let info = record.rmgr_info();
    let mut out = String::new();
    let _ = write!(out, "{} ", record.rmid);
    match rmgr.identify(info) {
        Some(name) => out.push_str(name),
        None => {
            let _ = write!(out, "UNKNOWN ({:02X})", info);
        }
    }
    out.push_str(": ");
    match rmgr.desc(record) {
        Ok(desc) => out.push_str(&desc),
        Err(err) => {
            let _ = write!(out, "<undecodable: {}>", err);
        }
    }
    for block in &record.blocks {
        let _ = write!(
            out,
            "; bkpb{}: {}{}",
            block.index,
            block.header.tag,
            if block.header.apply() { "" } else { " (check)" }
        );
    }
    out
}

/// Checkpoints, segment switches, OID batches and the other bookkeeping
/// records of the log itself.
#[derive(Debug, Default)]
pub struct XlogResourceManager;

impl ResourceManager for XlogResourceManager {
    fn id(&self) -> RmgrId {
        RmgrId::Xlog
    }

    fn redo(&self, record: &DecodedRecord, ctx: &RedoContext<'_>) -> WalResult<()> {
        match record.rmgr_info() {
            XLOG_NEXTOID => {
                let oid = decode_next_oid(&record.data)?;
                ctx.xacts.observe_next_oid(oid);
            }
            XLOG_CHECKPOINT_SHUTDOWN => {
                let body = CheckpointBody::decode(&record.data)?;
                // Nothing ran between the checkpoint and the shutdown, so
                // its counters are exact.
                ctx.xacts.reset_counters(&body.checkpoint);
            }
            XLOG_CHECKPOINT_ONLINE => {
                let body = CheckpointBody::decode(&record.data)?;
                ctx.xacts.observe_checkpoint(&body.checkpoint);
            }
            XLOG_FPW_CHANGE => {
                let enabled = decode_fpw_change(&record.data)?;
                log::debug!("full_page_writes changed to {} at {}", enabled, record.lsn);
            }
            // Replay of these is driven by the recovery loop or needs nothing
            // beyond restoring their backup blocks.
            XLOG_NOOP | XLOG_SWITCH | XLOG_BACKUP_END | XLOG_RESTORE_POINT
            | XLOG_END_OF_RECOVERY | XLOG_FPI => {}
            other => {
                return Err(WalError::Corrupt(format!(
                    "xlog_redo: unknown op code {:02X}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn identify(&self, info: u8) -> Option<&'static str> {
        Some(match info {
            XLOG_CHECKPOINT_SHUTDOWN => "CHECKPOINT_SHUTDOWN",
            XLOG_CHECKPOINT_ONLINE => "CHECKPOINT_ONLINE",
            XLOG_NOOP => "NOOP",
            XLOG_NEXTOID => "NEXTOID",
            XLOG_SWITCH => "SWITCH",
            XLOG_BACKUP_END => "BACKUP_END",
            XLOG_RESTORE_POINT => "RESTORE_POINT",
            XLOG_FPW_CHANGE => "FPW_CHANGE",
            XLOG_END_OF_RECOVERY => "END_OF_RECOVERY",
            XLOG_FPI => "FPI",
            _ => return None,
        })
    }

    fn desc(&self, record: &DecodedRecord) -> WalResult<String> {
        let info = record.rmgr_info();
        Ok(match info {
            XLOG_CHECKPOINT_SHUTDOWN | XLOG_CHECKPOINT_ONLINE => {
                let body = CheckpointBody::decode(&record.data)?;
                let cp = &body.checkpoint;
                let mut out = format!(
                    "checkpoint: redo {}; tli {}; prev tli {}; fpw {}; xid {}/{}; oid {}; relfilenode {}; multi {}; offset {}; oldest xid {} in DB {}; oldest running xid {}; {}",
                    cp.redo,
                    cp.this_tli,
                    cp.prev_tli,
                    cp.full_page_writes,
                    cp.next_xid_epoch,
                    cp.next_xid,
                    cp.next_oid,
                    cp.next_relfilenode,
                    cp.next_multi,
                    cp.next_multi_offset,
                    cp.oldest_xid,
                    cp.oldest_xid_db,
                    cp.oldest_active_xid,
                    if info == XLOG_CHECKPOINT_SHUTDOWN {
                        "shutdown"
                    } else {
                        "online"
                    }
                );
                if !body.prepared.is_empty() {
                    let _ = write!(out, "; prepared xacts {}", body.prepared.len());
                }
                out
            }
            XLOG_NOOP => "xlog no-op".to_string(),
            XLOG_NEXTOID => format!("nextOid: {}", decode_next_oid(&record.data)?),
            XLOG_SWITCH => "xlog switch".to_string(),
            XLOG_BACKUP_END => format!("backup end: {}", decode_backup_end(&record.data)?),
            XLOG_RESTORE_POINT => {
                let point = RestorePoint::decode(&record.data)?;
                format!(
                    "restore point: {} at {}",
                    point.name,
                    format_timestamptz(point.time)
                )
            }
            XLOG_FPW_CHANGE => format!(
                "full_page_writes: {}",
                if decode_fpw_change(&record.data)? {
                    "true"
                } else {
                    "false"
                }
            ),
            XLOG_END_OF_RECOVERY => {
                let eor = EndOfRecovery::decode(&record.data)?;
                format!(
                    "end_of_recovery: tli {}; prev tli {}; time {}",
                    eor.this_tli,
                    eor.prev_tli,
                    format_timestamptz(eor.time)
                )
            }
            XLOG_FPI => "full-page image".to_string(),
            other => format!("UNKNOWN ({:02X})", other),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::recovery::wal::codec::checkpoint::{CheckpointRecord, PreparedXactEntry};
    use crate::recovery::wal::codec::{encode_record, prepare_record, RecordInput};
    use crate::recovery::Lsn;

    fn decoded(input: &RecordInput<'_>) -> DecodedRecord {
        let prepared = prepare_record(input, Lsn::INVALID, false, false).unwrap();
        let bytes = encode_record(&prepared, Lsn::new(0x28));
        crate::recovery::wal::codec::decode_record(
            &bytes,
            Lsn::new(0x1000),
            Lsn::new(0x1000 + bytes.len() as u64),
        )
        .unwrap()
    }

    #[test]
    fn ids_roundtrip_through_names_and_bytes() {
        for id in RmgrId::iter() {
            assert_eq!(RmgrId::try_from(id as u8).unwrap(), id);
            assert_eq!(RmgrId::from_str(&id.to_string()).unwrap(), id);
            assert_eq!(resource_manager(id).id(), id);
        }
        assert!(RmgrId::try_from(9).is_err());
        assert_eq!(RmgrId::Xact.to_string(), "Transaction");
        assert!(all_safe_restartpoint());
    }

    #[test]
    fn checkpoint_description() {
        let body = CheckpointBody {
            checkpoint: CheckpointRecord {
                redo: Lsn::from_parts(0, 0x0100_0028),
                this_tli: 1,
                prev_tli: 1,
                full_page_writes: true,
                next_xid: 712,
                next_oid: 16384,
                next_relfilenode: 16384,
                next_multi: 1,
                oldest_xid: 3,
                oldest_xid_db: 1,
                ..CheckpointRecord::default()
            },
            prepared: vec![PreparedXactEntry {
                xid: 700,
                prepare_lsn: Lsn::new(0x40),
            }],
        }
        .encode();
        let mut input = RecordInput::new(RmgrId::Xlog, XLOG_CHECKPOINT_ONLINE);
        input.add_data(&body);
        let text = describe_record(&decoded(&input));
        assert_eq!(
            text,
            "XLOG CHECKPOINT_ONLINE: checkpoint: redo 0/1000028; tli 1; prev tli 1; fpw true; xid 0/712; oid 16384; relfilenode 16384; multi 1; offset 0; oldest xid 3 in DB 1; oldest running xid 0; online; prepared xacts 1"
        );
    }

    #[test]
    fn switch_and_unknown_info() {
        let input = RecordInput::new(RmgrId::Xlog, XLOG_SWITCH);
        assert_eq!(describe_record(&decoded(&input)), "XLOG SWITCH: xlog switch");

        let mut input = RecordInput::new(RmgrId::Xlog, 0xF0);
        input.add_data(b"?");
        assert_eq!(
            describe_record(&decoded(&input)),
            "XLOG UNKNOWN (F0): UNKNOWN (F0)"
        );
    }
}
