use bytes::{Buf, BufMut};

use crate::buffer::page::OffsetNumber;
use crate::buffer::{BlockNumber, RelFileNode};
use crate::error::{WalError, WalResult};

pub const XLOG_HEAP_INSERT: u8 = 0x00;
/// Set together with an operation when the record initializes its page.
pub const XLOG_HEAP_INIT_PAGE: u8 = 0x80;
pub const XLOG_HEAP_OPMASK: u8 = 0x70;

pub const HEAP_INSERT_SIZE: usize = 20;

/// Main data of an insert; the tuple follows as data of backup block 0 and
/// is left out when the page is logged whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapInsertRecord {
    pub rnode: RelFileNode,
    pub block: BlockNumber,
    pub offnum: OffsetNumber,
}

impl HeapInsertRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEAP_INSERT_SIZE);
        buf.put_u32_le(self.rnode.spc_node);
        buf.put_u32_le(self.rnode.db_node);
        buf.put_u32_le(self.rnode.rel_node);
        buf.put_u32_le(self.block);
        buf.put_u16_le(self.offnum);
        buf.put_u16_le(0);
        buf
    }

    /// Returns the record and the tuple bytes that follow it, if logged.
    pub fn decode(mut bytes: &[u8]) -> WalResult<(Self, &[u8])> {
        if bytes.len() < HEAP_INSERT_SIZE {
            return Err(WalError::Corrupt(format!(
                "heap insert record needs {} bytes, got {}",
                HEAP_INSERT_SIZE,
                bytes.len()
            )));
        }
        let rnode = RelFileNode::new(bytes.get_u32_le(), bytes.get_u32_le(), bytes.get_u32_le());
        let block = bytes.get_u32_le();
        let offnum = bytes.get_u16_le();
        bytes.advance(2);
        Ok((
            Self {
                rnode,
                block,
                offnum,
            },
            bytes,
        ))
    }
}
