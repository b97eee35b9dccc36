use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::buffer::{BufferTag, ForkNumber, RelFileNode, PAGE_SIZE};
use crate::error::{WalError, WalResult};

pub const BKP_BLOCK_HEADER_SIZE: usize = 24;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BkpBlockFlags: u8 {
        /// Replay restores the page from this image. Without it the image is
        /// only used to verify the page after redo.
        const APPLY = 0x01;
        const HAS_HOLE = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BkpBlockHeader {
    pub tag: BufferTag,
    pub flags: BkpBlockFlags,
    pub hole_offset: u16,
    pub hole_length: u16,
}

impl BkpBlockHeader {
    pub fn new(tag: BufferTag, apply: bool, hole: Option<(u16, u16)>) -> Self {
        let mut flags = BkpBlockFlags::empty();
        if apply {
            flags |= BkpBlockFlags::APPLY;
        }
        let (hole_offset, hole_length) = match hole {
            Some((offset, len)) if len > 0 => {
                flags |= BkpBlockFlags::HAS_HOLE;
                (offset, len)
            }
            _ => (0, 0),
        };
        Self {
            tag,
            flags,
            hole_offset,
            hole_length,
        }
    }

    #[inline]
    pub fn apply(&self) -> bool {
        self.flags.contains(BkpBlockFlags::APPLY)
    }

    /// Bytes of page image stored after this header.
    #[inline]
    pub fn image_len(&self) -> usize {
        PAGE_SIZE - self.hole_length as usize
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.tag.rnode.spc_node);
        buf.put_u32_le(self.tag.rnode.db_node);
        buf.put_u32_le(self.tag.rnode.rel_node);
        buf.put_u8(self.tag.fork as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u16_le(0);
        buf.put_u32_le(self.tag.block);
        buf.put_u16_le(self.hole_offset);
        buf.put_u16_le(self.hole_length);
    }

    pub fn decode(mut bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < BKP_BLOCK_HEADER_SIZE {
            return Err(WalError::Corrupt(
                "backup block header truncated".to_string(),
            ));
        }
        let rnode = RelFileNode::new(bytes.get_u32_le(), bytes.get_u32_le(), bytes.get_u32_le());
        let fork = ForkNumber::try_from(bytes.get_u8())?;
        let raw_flags = bytes.get_u8();
        let _pad = bytes.get_u16_le();
        let block = bytes.get_u32_le();
        let hole_offset = bytes.get_u16_le();
        let hole_length = bytes.get_u16_le();
        let flags = BkpBlockFlags::from_bits(raw_flags).ok_or_else(|| {
            WalError::Corrupt(format!("invalid backup block flags {:02X}", raw_flags))
        })?;
        if hole_offset as usize + hole_length as usize > PAGE_SIZE {
            return Err(WalError::Corrupt(format!(
                "backup block hole {}+{} exceeds page size",
                hole_offset, hole_length
            )));
        }
        if !flags.contains(BkpBlockFlags::HAS_HOLE) && (hole_offset != 0 || hole_length != 0) {
            return Err(WalError::Corrupt(
                "backup block without hole flag declares a hole".to_string(),
            ));
        }
        Ok(Self {
            tag: BufferTag::new(rnode, fork, block),
            flags,
            hole_offset,
            hole_length,
        })
    }
}

/// Appends the page image with the hole removed.
pub fn append_image(page: &[u8], header: &BkpBlockHeader, out: &mut Vec<u8>) {
    let start = header.hole_offset as usize;
    let end = start + header.hole_length as usize;
    out.extend_from_slice(&page[..start]);
    out.extend_from_slice(&page[end..]);
}

/// Rebuilds a full page from a stored image, zero-filling the hole.
pub fn restore_image(header: &BkpBlockHeader, image: &[u8]) -> WalResult<Box<[u8]>> {
    if image.len() != header.image_len() {
        return Err(WalError::Corrupt(format!(
            "backup block image is {} bytes, expected {}",
            image.len(),
            header.image_len()
        )));
    }
    let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
    let start = header.hole_offset as usize;
    let end = start + header.hole_length as usize;
    page[..start].copy_from_slice(&image[..start]);
    page[end..].copy_from_slice(&image[start..]);
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> BufferTag {
        BufferTag::main(RelFileNode::new(1663, 5, 16384), 7)
    }

    #[test]
    fn hole_is_zero_filled_on_restore() {
        let page: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8 + 1).collect();
        let header = BkpBlockHeader::new(tag(), true, Some((100, 4000)));
        let mut stored = Vec::new();
        header.encode(&mut stored);
        append_image(&page, &header, &mut stored);
        assert_eq!(stored.len(), BKP_BLOCK_HEADER_SIZE + PAGE_SIZE - 4000);

        let decoded = BkpBlockHeader::decode(&stored).unwrap();
        assert_eq!(decoded, header);
        let restored = restore_image(&decoded, &stored[BKP_BLOCK_HEADER_SIZE..]).unwrap();
        assert_eq!(&restored[..100], &page[..100]);
        assert!(restored[100..4100].iter().all(|b| *b == 0));
        assert_eq!(&restored[4100..], &page[4100..]);
    }

    #[test]
    fn rejects_hole_past_page_end() {
        let mut header = BkpBlockHeader::new(tag(), false, Some((8000, 100)));
        header.hole_length = 300;
        let mut stored = Vec::new();
        header.encode(&mut stored);
        assert!(BkpBlockHeader::decode(&stored).is_err());
    }
}
