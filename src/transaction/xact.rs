//! Transaction records: commit, abort, two-phase prepare and the decisions on
//! prepared transactions.

use bytes::{Buf, BufMut};

use crate::error::{WalError, WalResult};
use crate::recovery::resource_manager::{RedoContext, ResourceManager, RmgrId};
use crate::recovery::wal::codec::DecodedRecord;
use crate::utils::timestamp::{format_timestamptz, TimestampTz};

use super::{Oid, TransactionId, INVALID_OID};

pub const XLOG_XACT_COMMIT: u8 = 0x00;
pub const XLOG_XACT_PREPARE: u8 = 0x10;
pub const XLOG_XACT_ABORT: u8 = 0x20;
pub const XLOG_XACT_COMMIT_PREPARED: u8 = 0x30;
pub const XLOG_XACT_ABORT_PREPARED: u8 = 0x40;

/// Longest global transaction identifier accepted by prepare.
pub const GID_SIZE: usize = 200;

fn short(what: &str, need: usize, got: usize) -> WalError {
    WalError::Corrupt(format!("{} record needs {} bytes, got {}", what, need, got))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XactCommit {
    pub time: TimestampTz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XactAbort {
    pub time: TimestampTz,
}

impl XactCommit {
    pub fn encode(&self) -> Vec<u8> {
        self.time.to_le_bytes().to_vec()
    }

    pub fn decode(mut bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < 8 {
            return Err(short("commit", 8, bytes.len()));
        }
        Ok(Self {
            time: bytes.get_i64_le(),
        })
    }
}

impl XactAbort {
    pub fn encode(&self) -> Vec<u8> {
        self.time.to_le_bytes().to_vec()
    }

    pub fn decode(mut bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < 8 {
            return Err(short("abort", 8, bytes.len()));
        }
        Ok(Self {
            time: bytes.get_i64_le(),
        })
    }
}

/// State file of a prepared transaction, logged as the prepare record body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoPhaseFileHeader {
    pub xid: TransactionId,
    pub database: Oid,
    pub prepared_at: TimestampTz,
    pub owner: Oid,
    pub gid: String,
    pub tablespace_oid_to_delete_on_commit: Oid,
    pub tablespace_oid_to_delete_on_abort: Oid,
}

const TWO_PHASE_FIXED_SIZE: usize = 4 + 4 + 8 + 4 + 4 + 4 + 2;

impl TwoPhaseFileHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TWO_PHASE_FIXED_SIZE + self.gid.len());
        buf.put_u32_le(self.xid);
        buf.put_u32_le(self.database);
        buf.put_i64_le(self.prepared_at);
        buf.put_u32_le(self.owner);
        buf.put_u32_le(self.tablespace_oid_to_delete_on_commit);
        buf.put_u32_le(self.tablespace_oid_to_delete_on_abort);
        buf.put_u16_le(self.gid.len() as u16);
        buf.put_slice(self.gid.as_bytes());
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < TWO_PHASE_FIXED_SIZE {
            return Err(short("prepare", TWO_PHASE_FIXED_SIZE, bytes.len()));
        }
        let xid = bytes.get_u32_le();
        let database = bytes.get_u32_le();
        let prepared_at = bytes.get_i64_le();
        let owner = bytes.get_u32_le();
        let on_commit = bytes.get_u32_le();
        let on_abort = bytes.get_u32_le();
        let gid_len = bytes.get_u16_le() as usize;
        if bytes.len() < gid_len {
            return Err(short("prepare gid", gid_len, bytes.len()));
        }
        let gid = String::from_utf8(bytes[..gid_len].to_vec())
            .map_err(|_| WalError::Corrupt("prepare gid is not valid UTF-8".to_string()))?;
        Ok(Self {
            xid,
            database,
            prepared_at,
            owner,
            gid,
            tablespace_oid_to_delete_on_commit: on_commit,
            tablespace_oid_to_delete_on_abort: on_abort,
        })
    }

    pub fn describe(&self) -> String {
        let mut out = format!(
            "at = {}; gid = {}",
            format_timestamptz(self.prepared_at),
            self.gid
        );
        if self.tablespace_oid_to_delete_on_commit != INVALID_OID {
            out.push_str(&format!(
                "; tablespace_oid_to_delete_on_commit = {}",
                self.tablespace_oid_to_delete_on_commit
            ));
        }
        if self.tablespace_oid_to_delete_on_abort != INVALID_OID {
            out.push_str(&format!(
                "; tablespace_oid_to_delete_on_abort = {}",
                self.tablespace_oid_to_delete_on_abort
            ));
        }
        out
    }
}

/// Commit or abort of a previously prepared transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XactPreparedDecision {
    pub xid: TransactionId,
    pub time: TimestampTz,
}

impl XactPreparedDecision {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.put_u32_le(self.xid);
        buf.put_u32_le(0);
        buf.put_i64_le(self.time);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < 16 {
            return Err(short("prepared decision", 16, bytes.len()));
        }
        let xid = bytes.get_u32_le();
        bytes.advance(4);
        Ok(Self {
            xid,
            time: bytes.get_i64_le(),
        })
    }
}

/// Transaction outcome carried by a record, as used for recovery targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XactOutcome {
    pub xid: TransactionId,
    pub time: TimestampTz,
    pub committed: bool,
}

/// Decodes the outcome of a commit or abort record; `None` for any other
/// record.
pub fn xact_outcome(record: &DecodedRecord) -> WalResult<Option<XactOutcome>> {
    if record.rmid != RmgrId::Xact {
        return Ok(None);
    }
    let outcome = match record.rmgr_info() {
        XLOG_XACT_COMMIT => XactOutcome {
            xid: record.xid(),
            time: XactCommit::decode(&record.data)?.time,
            committed: true,
        },
        XLOG_XACT_ABORT => XactOutcome {
            xid: record.xid(),
            time: XactAbort::decode(&record.data)?.time,
            committed: false,
        },
        XLOG_XACT_COMMIT_PREPARED | XLOG_XACT_ABORT_PREPARED => {
            let decision = XactPreparedDecision::decode(&record.data)?;
            XactOutcome {
                xid: decision.xid,
                time: decision.time,
                committed: record.rmgr_info() == XLOG_XACT_COMMIT_PREPARED,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(outcome))
}

#[derive(Debug, Default)]
pub struct XactResourceManager;

impl ResourceManager for XactResourceManager {
    fn id(&self) -> RmgrId {
        RmgrId::Xact
    }

    fn redo(&self, record: &DecodedRecord, ctx: &RedoContext<'_>) -> WalResult<()> {
        let xacts = ctx.xacts;
        match record.rmgr_info() {
            XLOG_XACT_COMMIT => {
                XactCommit::decode(&record.data)?;
                xacts.replay_commit(record.xid())
            }
            XLOG_XACT_ABORT => {
                XactAbort::decode(&record.data)?;
                xacts.replay_abort(record.xid())
            }
            XLOG_XACT_PREPARE => {
                let header = TwoPhaseFileHeader::decode(&record.data)?;
                xacts.replay_prepare(header, record.lsn)
            }
            XLOG_XACT_COMMIT_PREPARED => {
                let decision = XactPreparedDecision::decode(&record.data)?;
                xacts.replay_finish_prepared(decision.xid, true)
            }
            XLOG_XACT_ABORT_PREPARED => {
                let decision = XactPreparedDecision::decode(&record.data)?;
                xacts.replay_finish_prepared(decision.xid, false)
            }
            other => Err(WalError::Corrupt(format!(
                "xact_redo: unknown op code {:02X}",
                other
            ))),
        }
    }

    fn identify(&self, info: u8) -> Option<&'static str> {
        Some(match info {
            XLOG_XACT_COMMIT => "COMMIT",
            XLOG_XACT_PREPARE => "PREPARE",
            XLOG_XACT_ABORT => "ABORT",
            XLOG_XACT_COMMIT_PREPARED => "COMMIT_PREPARED",
            XLOG_XACT_ABORT_PREPARED => "ABORT_PREPARED",
            _ => return None,
        })
    }

    fn desc(&self, record: &DecodedRecord) -> WalResult<String> {
        Ok(match record.rmgr_info() {
            XLOG_XACT_COMMIT => format!(
                "commit: {}",
                format_timestamptz(XactCommit::decode(&record.data)?.time)
            ),
            XLOG_XACT_ABORT => format!(
                "abort: {}",
                format_timestamptz(XactAbort::decode(&record.data)?.time)
            ),
            XLOG_XACT_PREPARE => format!(
                "prepare: {}",
                TwoPhaseFileHeader::decode(&record.data)?.describe()
            ),
            XLOG_XACT_COMMIT_PREPARED => {
                let decision = XactPreparedDecision::decode(&record.data)?;
                format!(
                    "commit prepared {}: {}",
                    decision.xid,
                    format_timestamptz(decision.time)
                )
            }
            XLOG_XACT_ABORT_PREPARED => {
                let decision = XactPreparedDecision::decode(&record.data)?;
                format!(
                    "abort prepared {}: {}",
                    decision.xid,
                    format_timestamptz(decision.time)
                )
            }
            other => format!("UNKNOWN ({:02X})", other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::resource_manager::describe_record;
    use crate::recovery::wal::codec::{decode_record, encode_record, prepare_record, RecordInput};
    use crate::recovery::Lsn;

    const PREPARED_AT: TimestampTz = 617_826_371_830_030;

    fn header(on_commit: Oid, on_abort: Oid) -> TwoPhaseFileHeader {
        TwoPhaseFileHeader {
            xid: 712,
            database: 1,
            prepared_at: PREPARED_AT,
            owner: 10,
            gid: "4242424242-0000000042".to_string(),
            tablespace_oid_to_delete_on_commit: on_commit,
            tablespace_oid_to_delete_on_abort: on_abort,
        }
    }

    fn decoded(info: u8, xid: TransactionId, body: &[u8]) -> DecodedRecord {
        let mut input = RecordInput::new(RmgrId::Xact, info).with_xid(xid);
        input.add_data(body);
        let prepared = prepare_record(&input, Lsn::INVALID, false, false).unwrap();
        let bytes = encode_record(&prepared, Lsn::INVALID);
        decode_record(&bytes, Lsn::new(0x2000), Lsn::new(0x2000 + bytes.len() as u64)).unwrap()
    }

    #[test]
    fn prepare_desc_with_commit_tablespace() {
        assert_eq!(
            header(42, INVALID_OID).describe(),
            "at = 2019-07-30 18:26:11.83003+00; gid = 4242424242-0000000042; tablespace_oid_to_delete_on_commit = 42"
        );
    }

    #[test]
    fn prepare_desc_with_abort_tablespace() {
        assert_eq!(
            header(INVALID_OID, 42).describe(),
            "at = 2019-07-30 18:26:11.83003+00; gid = 4242424242-0000000042; tablespace_oid_to_delete_on_abort = 42"
        );
    }

    #[test]
    fn prepare_desc_without_tablespace() {
        let record = decoded(XLOG_XACT_PREPARE, 712, &header(0, 0).encode());
        assert_eq!(
            describe_record(&record),
            "Transaction PREPARE: prepare: at = 2019-07-30 18:26:11.83003+00; gid = 4242424242-0000000042"
        );
        assert_eq!(TwoPhaseFileHeader::decode(&record.data).unwrap(), header(0, 0));
    }

    #[test]
    fn outcomes_of_commit_and_prepared_abort() {
        let commit = decoded(XLOG_XACT_COMMIT, 900, &XactCommit { time: PREPARED_AT }.encode());
        assert_eq!(
            xact_outcome(&commit).unwrap(),
            Some(XactOutcome {
                xid: 900,
                time: PREPARED_AT,
                committed: true
            })
        );
        assert_eq!(
            describe_record(&commit),
            "Transaction COMMIT: commit: 2019-07-30 18:26:11.83003+00"
        );

        let body = XactPreparedDecision {
            xid: 712,
            time: PREPARED_AT,
        }
        .encode();
        let abort = decoded(XLOG_XACT_ABORT_PREPARED, 0, &body);
        let outcome = xact_outcome(&abort).unwrap().unwrap();
        assert_eq!(outcome.xid, 712);
        assert!(!outcome.committed);

        let prepare = decoded(XLOG_XACT_PREPARE, 712, &header(0, 0).encode());
        assert_eq!(xact_outcome(&prepare).unwrap(), None);
    }

    #[test]
    fn truncated_bodies_are_corrupt() {
        assert!(XactCommit::decode(&[1, 2, 3]).is_err());
        let mut bytes = header(0, 0).encode();
        bytes.truncate(bytes.len() - 3);
        assert!(TwoPhaseFileHeader::decode(&bytes).is_err());
    }
}
