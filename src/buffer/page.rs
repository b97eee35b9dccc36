//! Layout of a standard data page: a 24-byte header, an array of line
//! pointers growing up from `pd_lower`, and tuples growing down from
//! `pd_upper`. The gap between the two is the "hole" a full-page image may
//! elide.

use crate::error::{WalError, WalResult};
use crate::recovery::lsn::maxalign;
use crate::recovery::Lsn;

pub const PAGE_SIZE: usize = 8192;
pub const PAGE_HEADER_SIZE: usize = 24;
pub const ITEM_ID_SIZE: usize = 4;
pub const PAGE_LAYOUT_VERSION: u16 = 4;

const PD_LSN: usize = 0;
const PD_CHECKSUM: usize = 8;
const PD_FLAGS: usize = 10;
const PD_LOWER: usize = 12;
const PD_UPPER: usize = 14;
const PD_SPECIAL: usize = 16;
const PD_PAGESIZE_VERSION: usize = 18;
const PD_PRUNE_XID: usize = 20;

const LP_NORMAL: u32 = 1;

/// Byte written over masked regions before pages are compared.
pub const MASK_MARKER: u8 = 0;

pub type OffsetNumber = u16;

#[inline]
fn read_u16(page: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([page[at], page[at + 1]])
}

#[inline]
fn write_u16(page: &mut [u8], at: usize, value: u16) {
    page[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn read_u32(page: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([page[at], page[at + 1], page[at + 2], page[at + 3]])
}

pub fn page_init(page: &mut [u8], special_size: usize) {
    page.fill(0);
    let special = (PAGE_SIZE - maxalign(special_size)) as u16;
    write_u16(page, PD_LOWER, PAGE_HEADER_SIZE as u16);
    write_u16(page, PD_UPPER, special);
    write_u16(page, PD_SPECIAL, special);
    write_u16(
        page,
        PD_PAGESIZE_VERSION,
        (PAGE_SIZE as u16) | PAGE_LAYOUT_VERSION,
    );
}

pub fn page_is_new(page: &[u8]) -> bool {
    read_u16(page, PD_UPPER) == 0
}

pub fn page_lsn(page: &[u8]) -> Lsn {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&page[PD_LSN..PD_LSN + 8]);
    Lsn::new(u64::from_le_bytes(raw))
}

pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
    page[PD_LSN..PD_LSN + 8].copy_from_slice(&lsn.as_u64().to_le_bytes());
}

pub fn page_lower(page: &[u8]) -> u16 {
    read_u16(page, PD_LOWER)
}

pub fn page_upper(page: &[u8]) -> u16 {
    read_u16(page, PD_UPPER)
}

/// The unused region between line pointers and tuple data, if the header
/// looks sane enough to trust.
pub fn page_hole(page: &[u8]) -> Option<(u16, u16)> {
    let lower = page_lower(page) as usize;
    let upper = page_upper(page) as usize;
    if lower >= PAGE_HEADER_SIZE && lower < upper && upper <= PAGE_SIZE {
        Some((lower as u16, (upper - lower) as u16))
    } else {
        None
    }
}

pub fn page_item_count(page: &[u8]) -> u16 {
    let lower = page_lower(page) as usize;
    if lower <= PAGE_HEADER_SIZE {
        return 0;
    }
    ((lower - PAGE_HEADER_SIZE) / ITEM_ID_SIZE) as u16
}

/// Bytes available for one more item, line pointer included.
pub fn page_free_space(page: &[u8]) -> usize {
    let lower = page_lower(page) as usize;
    let upper = page_upper(page) as usize;
    upper.saturating_sub(lower + ITEM_ID_SIZE)
}

/// Appends an item and returns its 1-based offset number.
pub fn page_add_item(page: &mut [u8], item: &[u8]) -> WalResult<OffsetNumber> {
    if page_is_new(page) {
        return Err(WalError::Internal(
            "cannot add item to an uninitialized page".to_string(),
        ));
    }
    let lower = page_lower(page) as usize;
    let upper = page_upper(page) as usize;
    let aligned = maxalign(item.len());
    if item.len() >= 1 << 15 || lower + ITEM_ID_SIZE + aligned > upper {
        return Err(WalError::Internal(format!(
            "no room for item of {} bytes (lower {}, upper {})",
            item.len(),
            lower,
            upper
        )));
    }
    let new_upper = upper - aligned;
    page[new_upper..new_upper + item.len()].copy_from_slice(item);
    let item_id = (new_upper as u32) | (LP_NORMAL << 15) | ((item.len() as u32) << 17);
    page[lower..lower + ITEM_ID_SIZE].copy_from_slice(&item_id.to_le_bytes());
    write_u16(page, PD_LOWER, (lower + ITEM_ID_SIZE) as u16);
    write_u16(page, PD_UPPER, new_upper as u16);
    Ok(page_item_count(page))
}

pub fn page_get_item(page: &[u8], offnum: OffsetNumber) -> Option<&[u8]> {
    if offnum == 0 || offnum > page_item_count(page) {
        return None;
    }
    let item_id = read_u32(page, PAGE_HEADER_SIZE + (offnum as usize - 1) * ITEM_ID_SIZE);
    let off = (item_id & 0x7FFF) as usize;
    let len = (item_id >> 17) as usize;
    page.get(off..off + len)
}

pub fn page_prune_xid(page: &[u8]) -> u32 {
    read_u32(page, PD_PRUNE_XID)
}

/// Clears fields that legitimately differ between a replayed page and its
/// logged image: LSN and checksum.
pub fn mask_page_lsn_and_checksum(page: &mut [u8]) {
    page[PD_LSN..PD_LSN + 8].fill(MASK_MARKER);
    write_u16(page, PD_CHECKSUM, 0);
}

pub fn mask_page_hint_bits(page: &mut [u8]) {
    write_u16(page, PD_FLAGS, 0);
    page[PD_PRUNE_XID..PD_PRUNE_XID + 4].fill(MASK_MARKER);
}

pub fn mask_unused_space(page: &mut [u8]) {
    if let Some((offset, len)) = page_hole(page) {
        let start = offset as usize;
        page[start..start + len as usize].fill(MASK_MARKER);
    }
}
