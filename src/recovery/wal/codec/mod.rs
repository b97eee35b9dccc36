pub mod backup_block;
pub mod checkpoint;

use bytes::{Buf, BufMut};

use crate::buffer::page::{page_hole, page_lsn};
use crate::buffer::{BufferTag, PAGE_SIZE};
use crate::error::{WalError, WalResult};
use crate::recovery::resource_manager::RmgrId;
use crate::recovery::Lsn;
use crate::transaction::TransactionId;

use backup_block::{append_image, restore_image, BkpBlockHeader, BKP_BLOCK_HEADER_SIZE};
use checkpoint::XLOG_SWITCH;

pub const RECORD_HEADER_SIZE: usize = 32;
/// Header bytes covered by the CRC: everything before the crc field.
const RECORD_HEADER_CRC_SPAN: usize = 24;

pub const XLR_MAX_BKP_BLOCKS: usize = 4;
pub const XLR_BKP_BLOCK_MASK: u8 = 0x0F;
pub const XLR_RMGR_INFO_MASK: u8 = 0xF0;
pub const XLR_CHECK_CONSISTENCY: u8 = 0x01;

/// Records larger than this are treated as corrupt.
pub const MAX_RECORD_LENGTH: usize = 1024 * 1024 * 1024;

#[inline]
pub const fn xlr_bkp_block(index: usize) -> u8 {
    0x08 >> index
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub tot_len: u32,
    pub xid: TransactionId,
    pub len: u32,
    pub info: u8,
    pub rmid: u8,
    pub extended_info: u8,
    pub prev: Lsn,
    pub crc: u32,
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.tot_len);
        buf.put_u32_le(self.xid);
        buf.put_u32_le(self.len);
        buf.put_u8(self.info);
        buf.put_u8(self.rmid);
        buf.put_u8(self.extended_info);
        buf.put_u8(0);
        buf.put_u64_le(self.prev.as_u64());
        buf.put_u32_le(self.crc);
        buf.put_u32_le(0);
        out
    }

    pub fn decode(mut bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(WalError::Corrupt(format!(
                "record header needs {} bytes, got {}",
                RECORD_HEADER_SIZE,
                bytes.len()
            )));
        }
        let tot_len = bytes.get_u32_le();
        let xid = bytes.get_u32_le();
        let len = bytes.get_u32_le();
        let info = bytes.get_u8();
        let rmid = bytes.get_u8();
        let extended_info = bytes.get_u8();
        let pad = bytes.get_u8();
        let prev = Lsn::new(bytes.get_u64_le());
        let crc = bytes.get_u32_le();
        let tail_pad = bytes.get_u32_le();
        if pad != 0 || tail_pad != 0 {
            return Err(WalError::Corrupt(
                "record header padding is not zero".to_string(),
            ));
        }
        Ok(Self {
            tot_len,
            xid,
            len,
            info,
            rmid,
            extended_info,
            prev,
            crc,
        })
    }

    #[inline]
    pub fn backup_block_bits(&self) -> u8 {
        self.info & XLR_BKP_BLOCK_MASK
    }
}

/// A page the record touches. The page must be the current content, already
/// modified by the caller, and must stay locked until insertion returns.
#[derive(Debug, Clone, Copy)]
pub struct BufferRef<'a> {
    pub tag: BufferTag,
    pub page: &'a [u8],
    /// The page follows the standard layout, so its hole may be elided.
    pub standard_layout: bool,
}

#[derive(Debug, Clone, Copy)]
struct DataChunk<'a> {
    data: &'a [u8],
    buffer: Option<usize>,
}

/// Input to the insertion engine: rmgr id, info bits, data chunks and the
/// buffers those chunks describe. Chunks tied to a buffer are dropped from the
/// record when that buffer is logged as a full-page image.
#[derive(Debug, Clone)]
pub struct RecordInput<'a> {
    pub rmid: RmgrId,
    pub info: u8,
    pub xid: TransactionId,
    chunks: Vec<DataChunk<'a>>,
    buffers: Vec<BufferRef<'a>>,
}

impl<'a> RecordInput<'a> {
    pub fn new(rmid: RmgrId, info: u8) -> Self {
        Self {
            rmid,
            info,
            xid: 0,
            chunks: Vec::new(),
            buffers: Vec::new(),
        }
    }

    pub fn with_xid(mut self, xid: TransactionId) -> Self {
        self.xid = xid;
        self
    }

    pub fn add_data(&mut self, data: &'a [u8]) -> &mut Self {
        self.chunks.push(DataChunk { data, buffer: None });
        self
    }

    /// Registers a buffer and returns its backup-block index.
    pub fn register_buffer(&mut self, buffer: BufferRef<'a>) -> WalResult<usize> {
        if let Some(idx) = self.buffers.iter().position(|b| b.tag == buffer.tag) {
            return Ok(idx);
        }
        if self.buffers.len() >= XLR_MAX_BKP_BLOCKS {
            return Err(WalError::Panic(format!(
                "too many buffers registered for one WAL record (max {})",
                XLR_MAX_BKP_BLOCKS
            )));
        }
        if buffer.page.len() != PAGE_SIZE {
            return Err(WalError::Internal(format!(
                "buffer {} has {} bytes, expected {}",
                buffer.tag,
                buffer.page.len(),
                PAGE_SIZE
            )));
        }
        self.buffers.push(buffer);
        Ok(self.buffers.len() - 1)
    }

    pub fn add_buffer_data(&mut self, buffer: usize, data: &'a [u8]) -> &mut Self {
        self.chunks.push(DataChunk {
            data,
            buffer: Some(buffer),
        });
        self
    }

    pub fn buffers(&self) -> &[BufferRef<'a>] {
        &self.buffers
    }

    pub fn is_switch(&self) -> bool {
        self.rmid == RmgrId::Xlog && self.info & XLR_RMGR_INFO_MASK == XLOG_SWITCH
    }
}

/// Per-buffer outcome of the unlocked scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDecision {
    pub page_lsn: Lsn,
    /// Logged as a full-page image that replay restores.
    pub backup: bool,
    /// Logged only so replay can verify the page.
    pub check_only: bool,
}

/// A record whose body and body CRC were computed without holding the
/// insertion lock; only the prev-link and header CRC remain.
#[derive(Debug, Clone)]
pub struct PreparedRecord {
    pub rmid: RmgrId,
    pub info: u8,
    pub extended_info: u8,
    pub xid: TransactionId,
    pub data_len: u32,
    pub body: Vec<u8>,
    body_crc: u32,
    pub decisions: Vec<BufferDecision>,
    /// Redo pointer and page-write mode the decisions were computed against.
    pub assumed_redo: Lsn,
    pub do_page_writes: bool,
}

impl PreparedRecord {
    #[inline]
    pub fn total_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.body.len()
    }

    pub fn is_switch(&self) -> bool {
        self.rmid == RmgrId::Xlog && self.info & XLR_RMGR_INFO_MASK == XLOG_SWITCH
    }

    /// Completes the header once the previous record's position is known.
    pub fn finish_header(&self, prev: Lsn) -> RecordHeader {
        let mut header = RecordHeader {
            tot_len: self.total_len() as u32,
            xid: self.xid,
            len: self.data_len,
            info: self.info,
            rmid: self.rmid as u8,
            extended_info: self.extended_info,
            prev,
            crc: 0,
        };
        let bytes = header.encode();
        header.crc = crc32c::crc32c_append(self.body_crc, &bytes[..RECORD_HEADER_CRC_SPAN]);
        header
    }

    /// Buffers whose page LSN fell behind `redo` without being backed up.
    pub fn stale_against(&self, redo: Lsn) -> bool {
        self.do_page_writes
            && self
                .decisions
                .iter()
                .any(|d| !d.backup && d.page_lsn <= redo)
    }
}

/// The unlocked half of insertion: decide which buffers need full-page
/// images, lay out the body and compute its CRC.
pub fn prepare_record(
    input: &RecordInput<'_>,
    redo: Lsn,
    do_page_writes: bool,
    check_consistency: bool,
) -> WalResult<PreparedRecord> {
    if input.info & XLR_BKP_BLOCK_MASK != 0 {
        return Err(WalError::Panic(format!(
            "invalid xlog info mask {:02X}",
            input.info
        )));
    }

    let decisions: Vec<BufferDecision> = input
        .buffers
        .iter()
        .map(|buffer| {
            let lsn = page_lsn(buffer.page);
            let backup = do_page_writes && lsn <= redo;
            BufferDecision {
                page_lsn: lsn,
                backup,
                check_only: !backup && check_consistency,
            }
        })
        .collect();

    let mut body = Vec::new();
    for chunk in &input.chunks {
        let skipped = chunk
            .buffer
            .is_some_and(|idx| decisions.get(idx).is_some_and(|d| d.backup));
        if !skipped {
            body.extend_from_slice(chunk.data);
        }
    }
    let data_len = body.len();

    let mut info = input.info;
    for (idx, (buffer, decision)) in input.buffers.iter().zip(&decisions).enumerate() {
        if !decision.backup && !decision.check_only {
            continue;
        }
        info |= xlr_bkp_block(idx);
        let hole = if decision.backup && buffer.standard_layout {
            page_hole(buffer.page)
        } else {
            None
        };
        let header = BkpBlockHeader::new(buffer.tag, decision.backup, hole);
        header.encode(&mut body);
        append_image(buffer.page, &header, &mut body);
    }

    if data_len == 0 && info & XLR_BKP_BLOCK_MASK == 0 && !input.is_switch() {
        return Err(WalError::Panic("invalid xlog record length 0".to_string()));
    }
    if RECORD_HEADER_SIZE + body.len() > MAX_RECORD_LENGTH {
        return Err(WalError::Panic(format!(
            "xlog record of {} bytes is too large",
            body.len()
        )));
    }

    let mut body_crc = crc32c::crc32c(&body[..data_len]);
    body_crc = crc32c::crc32c_append(body_crc, &body[data_len..]);

    Ok(PreparedRecord {
        rmid: input.rmid,
        info,
        extended_info: if check_consistency {
            XLR_CHECK_CONSISTENCY
        } else {
            0
        },
        xid: input.xid,
        data_len: data_len as u32,
        body,
        body_crc,
        decisions,
        assumed_redo: redo,
        do_page_writes,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupBlock {
    pub index: usize,
    pub header: BkpBlockHeader,
    /// Full page with the hole zero-filled.
    pub page: Box<[u8]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    /// Start of the record header.
    pub lsn: Lsn,
    /// First byte after the record, aligned.
    pub end_lsn: Lsn,
    pub header: RecordHeader,
    pub rmid: RmgrId,
    pub data: Vec<u8>,
    pub blocks: Vec<BackupBlock>,
}

impl DecodedRecord {
    #[inline]
    pub fn rmgr_info(&self) -> u8 {
        self.header.info & XLR_RMGR_INFO_MASK
    }

    #[inline]
    pub fn xid(&self) -> TransactionId {
        self.header.xid
    }

    pub fn block(&self, index: usize) -> Option<&BackupBlock> {
        self.blocks.iter().find(|b| b.index == index)
    }

    /// Whether replay restores block `index` from its image instead of
    /// running the rmgr's redo for it.
    pub fn block_restored(&self, index: usize) -> bool {
        self.block(index).is_some_and(|b| b.header.apply())
    }

    pub fn checks_consistency(&self) -> bool {
        self.header.extended_info & XLR_CHECK_CONSISTENCY != 0
    }

    pub fn is_switch(&self) -> bool {
        self.rmid == RmgrId::Xlog && self.rmgr_info() == XLOG_SWITCH
    }
}

/// Parses and validates one fully reassembled record.
pub fn decode_record(bytes: &[u8], lsn: Lsn, end_lsn: Lsn) -> WalResult<DecodedRecord> {
    let header = RecordHeader::decode(bytes)?;
    if header.tot_len as usize != bytes.len() {
        return Err(WalError::Corrupt(format!(
            "record at {} declares length {} but spans {} bytes",
            lsn,
            header.tot_len,
            bytes.len()
        )));
    }
    let rmid = RmgrId::try_from(header.rmid)
        .map_err(|_| WalError::Corrupt(format!("invalid resource manager ID {} at {}", header.rmid, lsn)))?;
    let data_end = RECORD_HEADER_SIZE
        .checked_add(header.len as usize)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            WalError::Corrupt(format!(
                "invalid record length at {}: data {} exceeds total {}",
                lsn, header.len, header.tot_len
            ))
        })?;
    let is_switch = rmid == RmgrId::Xlog && header.info & XLR_RMGR_INFO_MASK == XLOG_SWITCH;
    if header.len == 0 && header.backup_block_bits() == 0 && !is_switch {
        return Err(WalError::Corrupt(format!("record with zero length at {}", lsn)));
    }

    let mut blocks = Vec::new();
    let mut pos = data_end;
    for index in 0..XLR_MAX_BKP_BLOCKS {
        if header.info & xlr_bkp_block(index) == 0 {
            continue;
        }
        let bkp = BkpBlockHeader::decode(&bytes[pos..])?;
        let image_start = pos + BKP_BLOCK_HEADER_SIZE;
        let image_end = image_start + bkp.image_len();
        if image_end > bytes.len() {
            return Err(WalError::Corrupt(format!(
                "backup block {} of record at {} is truncated",
                index, lsn
            )));
        }
        let page = restore_image(&bkp, &bytes[image_start..image_end])?;
        blocks.push(BackupBlock {
            index,
            header: bkp,
            page,
        });
        pos = image_end;
    }
    if pos != bytes.len() {
        return Err(WalError::Corrupt(format!(
            "incorrect total length in record at {}",
            lsn
        )));
    }

    let mut crc = crc32c::crc32c(&bytes[RECORD_HEADER_SIZE..data_end]);
    crc = crc32c::crc32c_append(crc, &bytes[data_end..]);
    crc = crc32c::crc32c_append(crc, &bytes[..RECORD_HEADER_CRC_SPAN]);
    if crc != header.crc {
        return Err(WalError::Corrupt(format!(
            "incorrect resource manager data checksum in record at {}",
            lsn
        )));
    }

    Ok(DecodedRecord {
        lsn,
        end_lsn,
        header,
        rmid,
        data: bytes[RECORD_HEADER_SIZE..data_end].to_vec(),
        blocks,
    })
}

/// Serializes a prepared record into one contiguous buffer. The insertion
/// engine copies the same bytes into WAL pages piecewise.
pub fn encode_record(prepared: &PreparedRecord, prev: Lsn) -> Vec<u8> {
    let header = prepared.finish_header(prev);
    let mut out = Vec::with_capacity(prepared.total_len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&prepared.body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::page::{page_add_item, page_init, set_page_lsn};
    use crate::buffer::RelFileNode;

    fn heap_page(lsn: u64, items: usize) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page_init(&mut page, 0);
        for i in 0..items {
            page_add_item(&mut page, format!("tuple-{i}").as_bytes()).unwrap();
        }
        set_page_lsn(&mut page, Lsn::new(lsn));
        page
    }

    fn tag(block: u32) -> BufferTag {
        BufferTag::main(RelFileNode::new(1663, 1, 16384), block)
    }

    fn roundtrip(prepared: &PreparedRecord, prev: Lsn) -> DecodedRecord {
        let bytes = encode_record(prepared, prev);
        decode_record(&bytes, Lsn::new(0x100), Lsn::new(0x100 + bytes.len() as u64)).unwrap()
    }

    #[test]
    fn plain_record_roundtrip() {
        let mut input = RecordInput::new(RmgrId::Heap, 0x20).with_xid(77);
        input.add_data(b"abc").add_data(b"defgh");
        let prepared = prepare_record(&input, Lsn::new(10), true, false).unwrap();
        let decoded = roundtrip(&prepared, Lsn::new(0x40));
        assert_eq!(decoded.rmid, RmgrId::Heap);
        assert_eq!(decoded.rmgr_info(), 0x20);
        assert_eq!(decoded.xid(), 77);
        assert_eq!(decoded.header.prev, Lsn::new(0x40));
        assert_eq!(decoded.data, b"abcdefgh");
        assert!(decoded.blocks.is_empty());
    }

    #[test]
    fn stale_page_is_backed_up_and_its_data_dropped() {
        let page = heap_page(0x50, 3);
        let mut input = RecordInput::new(RmgrId::Heap, 0);
        let idx = input
            .register_buffer(BufferRef {
                tag: tag(3),
                page: &page,
                standard_layout: true,
            })
            .unwrap();
        input.add_buffer_data(idx, b"per-buffer").add_data(b"main");

        let prepared = prepare_record(&input, Lsn::new(0x80), true, false).unwrap();
        assert!(prepared.decisions[0].backup);
        assert_eq!(prepared.data_len, 4);
        let decoded = roundtrip(&prepared, Lsn::INVALID);
        assert_eq!(decoded.data, b"main");
        let block = decoded.block(0).unwrap();
        assert!(block.header.apply());
        assert!(block.header.hole_length > 0);
        assert_eq!(&block.page[..], &page[..]);
        assert!(decoded.block_restored(0));
    }

    #[test]
    fn fresh_page_keeps_data() {
        let page = heap_page(0x90, 1);
        let mut input = RecordInput::new(RmgrId::Heap, 0);
        let idx = input
            .register_buffer(BufferRef {
                tag: tag(1),
                page: &page,
                standard_layout: true,
            })
            .unwrap();
        input.add_buffer_data(idx, b"tuple");
        let prepared = prepare_record(&input, Lsn::new(0x80), true, false).unwrap();
        assert!(prepared.stale_against(Lsn::new(0x90)));
        assert!(!prepared.stale_against(Lsn::new(0x8F)));
        let decoded = roundtrip(&prepared, Lsn::INVALID);
        assert_eq!(decoded.data, b"tuple");
        assert!(decoded.blocks.is_empty());
    }

    #[test]
    fn consistency_image_keeps_data_and_full_page() {
        let page = heap_page(0x90, 2);
        let mut input = RecordInput::new(RmgrId::Heap, 0);
        let idx = input
            .register_buffer(BufferRef {
                tag: tag(1),
                page: &page,
                standard_layout: true,
            })
            .unwrap();
        input.add_buffer_data(idx, b"tuple");
        let prepared = prepare_record(&input, Lsn::new(0x80), true, true).unwrap();
        let decoded = roundtrip(&prepared, Lsn::INVALID);
        assert!(decoded.checks_consistency());
        assert_eq!(decoded.data, b"tuple");
        let block = decoded.block(0).unwrap();
        assert!(!block.header.apply());
        assert_eq!(block.header.hole_length, 0);
        assert!(!decoded.block_restored(0));
    }

    #[test]
    fn zero_length_only_with_backup_or_switch() {
        let input = RecordInput::new(RmgrId::Heap, 0);
        assert!(matches!(
            prepare_record(&input, Lsn::INVALID, true, false),
            Err(WalError::Panic(_))
        ));
        let switch = RecordInput::new(RmgrId::Xlog, XLOG_SWITCH);
        let prepared = prepare_record(&switch, Lsn::INVALID, true, false).unwrap();
        assert!(roundtrip(&prepared, Lsn::new(8)).is_switch());

        let page = heap_page(0, 0);
        let mut input = RecordInput::new(RmgrId::Heap, 0x80);
        input
            .register_buffer(BufferRef {
                tag: tag(0),
                page: &page,
                standard_layout: true,
            })
            .unwrap();
        let prepared = prepare_record(&input, Lsn::new(1), true, false).unwrap();
        let decoded = roundtrip(&prepared, Lsn::INVALID);
        assert!(decoded.data.is_empty());
        assert_eq!(decoded.blocks.len(), 1);
    }

    #[test]
    fn any_flipped_bit_is_detected() {
        let page = heap_page(0x10, 2);
        let mut input = RecordInput::new(RmgrId::Heap, 0x10).with_xid(9);
        let idx = input
            .register_buffer(BufferRef {
                tag: tag(2),
                page: &page,
                standard_layout: true,
            })
            .unwrap();
        input.add_buffer_data(idx, b"x").add_data(b"payload");
        let prepared = prepare_record(&input, Lsn::new(0x20), true, false).unwrap();
        let bytes = encode_record(&prepared, Lsn::new(0x18));
        assert!(prepared.decisions[0].backup);
        assert!(bytes.len() > RECORD_HEADER_SIZE + BKP_BLOCK_HEADER_SIZE);
        decode_record(&bytes, Lsn::new(0x100), Lsn::new(0x200)).unwrap();

        let mut corrupt = bytes.clone();
        for pos in 0..bytes.len() {
            for bit in 0..8 {
                corrupt[pos] ^= 1 << bit;
                assert!(
                    decode_record(&corrupt, Lsn::new(0x100), Lsn::new(0x200)).is_err(),
                    "flip of bit {} at byte {} went undetected",
                    bit,
                    pos
                );
                corrupt[pos] ^= 1 << bit;
            }
        }
    }

    #[test]
    fn rejects_unknown_rmgr_and_bad_masks() {
        let mut input = RecordInput::new(RmgrId::Xact, 0);
        input.add_data(b"z");
        let prepared = prepare_record(&input, Lsn::INVALID, false, false).unwrap();
        let mut bytes = encode_record(&prepared, Lsn::INVALID);
        bytes[13] = 0xEE;
        assert!(decode_record(&bytes, Lsn::new(8), Lsn::new(64)).is_err());

        let bad = RecordInput::new(RmgrId::Xact, 0x01);
        assert!(prepare_record(&bad, Lsn::INVALID, false, false).is_err());
    }
}
