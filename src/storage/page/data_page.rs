//! Layout of every page after page 1.
//!
//! ```text
//! [FreeSpaceOffset: u16][data ...]
//! ```
//!
//! Data is only ever appended at the free space offset; nothing is reclaimed.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DbError, DbResult};
use crate::storage::page::Page;
use crate::storage::PAGE_SIZE;

const OF_FREE: usize = 0;
const OF_DATA: usize = 2;

/// The most bytes a single record can occupy in one page.
pub const MAX_FREE_SPACE: usize = PAGE_SIZE - OF_DATA;

pub fn init_raw() -> Box<[u8; PAGE_SIZE]> {
    let mut raw = Box::new([0u8; PAGE_SIZE]);
    set_fso(&mut raw[..], OF_DATA as u16);
    raw
}

fn set_fso(raw: &mut [u8], offset: u16) {
    BigEndian::write_u16(&mut raw[OF_FREE..OF_FREE + 2], offset);
}

fn fso(raw: &[u8]) -> u16 {
    BigEndian::read_u16(&raw[OF_FREE..OF_FREE + 2])
}

pub fn free_space_offset(page: &Page) -> u16 {
    page.read(|data| fso(data))
}

pub fn free_space(page: &Page) -> usize {
    PAGE_SIZE - free_space_offset(page) as usize
}

/// Append `raw` at the free space offset and return where it landed.
pub fn insert(page: &Page, raw: &[u8]) -> DbResult<u16> {
    page.write(|data| {
        let offset = fso(data) as usize;
        let end = offset + raw.len();
        if end > PAGE_SIZE {
            return Err(DbError::OutOfBounds {
                start: offset,
                end,
                limit: PAGE_SIZE,
            });
        }
        data[offset..end].copy_from_slice(raw);
        set_fso(data, end as u16);
        Ok(offset as u16)
    })
}

/// Replay an insert at a fixed offset, advancing the free space offset if
/// the record ends past it.
pub fn recover_insert(page: &Page, raw: &[u8], offset: u16) -> DbResult<()> {
    page.write(|data| {
        let end = write_raw(data, raw, offset)?;
        if fso(data) < end {
            set_fso(data, end);
        }
        Ok(())
    })
}

/// Replay an update at a fixed offset.
pub fn recover_update(page: &Page, raw: &[u8], offset: u16) -> DbResult<()> {
    page.write(|data| write_raw(data, raw, offset).map(|_| ()))
}

fn write_raw(data: &mut [u8; PAGE_SIZE], raw: &[u8], offset: u16) -> DbResult<u16> {
    let start = offset as usize;
    let end = start + raw.len();
    if start < OF_DATA || end > PAGE_SIZE {
        return Err(DbError::OutOfBounds {
            start,
            end,
            limit: PAGE_SIZE,
        });
    }
    data[start..end].copy_from_slice(raw);
    Ok(end as u16)
}
