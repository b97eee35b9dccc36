pub mod archive;
pub mod backup;
pub mod checkpoint;
pub mod control_file;
pub mod lsn;
pub mod recovery_manager;
pub mod redo;
pub mod resource_manager;
pub mod retention;
pub mod source;
pub mod timeline;
pub mod wal;

pub use checkpoint::{CheckpointFlags, CheckpointOutcome, Checkpointer};
pub use control_file::{ControlFileData, ControlFileManager, DbState};
pub use lsn::{Lsn, SegNo, TimeLineId};
pub use recovery_manager::{RecoveryManager, RecoverySummary};
pub use resource_manager::RmgrId;
pub use source::{PromoteSignal, WalStream};
pub use wal::{InsertPermission, WalManager, WalReader, WalSession, WalWriterHandle};
