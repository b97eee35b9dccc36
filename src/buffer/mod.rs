mod buffer_manager;
pub mod page;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{WalError, WalResult};
use crate::transaction::Oid;

pub use buffer_manager::{BufferManager, PageWriteGuard};
pub use page::PAGE_SIZE;

pub type BlockNumber = u32;

pub const INVALID_BLOCK_NUMBER: BlockNumber = u32::MAX;

/// Physical identity of a relation's storage files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelFileNode {
    pub spc_node: Oid,
    pub db_node: Oid,
    pub rel_node: Oid,
}

impl RelFileNode {
    pub const fn new(spc_node: Oid, db_node: Oid, rel_node: Oid) -> Self {
        Self {
            spc_node,
            db_node,
            rel_node,
        }
    }
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc_node, self.db_node, self.rel_node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ForkNumber {
    Main = 0,
    Fsm = 1,
    VisibilityMap = 2,
    Init = 3,
}

impl ForkNumber {
    pub fn file_suffix(self) -> &'static str {
        match self {
            ForkNumber::Main => "",
            ForkNumber::Fsm => "_fsm",
            ForkNumber::VisibilityMap => "_vm",
            ForkNumber::Init => "_init",
        }
    }
}

impl TryFrom<u8> for ForkNumber {
    type Error = WalError;

    fn try_from(value: u8) -> WalResult<Self> {
        match value {
            0 => Ok(ForkNumber::Main),
            1 => Ok(ForkNumber::Fsm),
            2 => Ok(ForkNumber::VisibilityMap),
            3 => Ok(ForkNumber::Init),
            other => Err(WalError::Corrupt(format!("invalid fork number {}", other))),
        }
    }
}

/// Identifies one block of one relation fork; the key of the buffer cache
/// and of every backup block in the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferTag {
    pub rnode: RelFileNode,
    pub fork: ForkNumber,
    pub block: BlockNumber,
}

impl BufferTag {
    pub const fn new(rnode: RelFileNode, fork: ForkNumber, block: BlockNumber) -> Self {
        Self { rnode, fork, block }
    }

    pub const fn main(rnode: RelFileNode, block: BlockNumber) -> Self {
        Self::new(rnode, ForkNumber::Main, block)
    }
}

impl fmt::Display for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rel {} fork {:?} blk {}",
            self.rnode, self.fork, self.block
        )
    }
}
