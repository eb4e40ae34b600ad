//! Page 1 carries the clean-shutdown marker.
//!
//! On open, 8 random bytes are written at `OF_VC`; a clean close copies them
//! to `OF_VC + LEN_VC`. If the two ranges differ at the next open, the
//! previous process did not shut down cleanly and recovery must run.

use rand::RngCore;

use crate::storage::page::Page;
use crate::storage::PAGE_SIZE;

const OF_VC: usize = 100;
const LEN_VC: usize = 8;

/// Raw bytes of a fresh page 1, already marked open.
pub fn init_raw() -> Box<[u8; PAGE_SIZE]> {
    let mut raw = Box::new([0u8; PAGE_SIZE]);
    set_vc_open_raw(&mut raw);
    raw
}

pub fn set_vc_open(page: &Page) {
    page.write(|data| set_vc_open_raw(data));
}

fn set_vc_open_raw(raw: &mut [u8; PAGE_SIZE]) {
    rand::thread_rng().fill_bytes(&mut raw[OF_VC..OF_VC + LEN_VC]);
}

pub fn set_vc_close(page: &Page) {
    page.write(|data| data.copy_within(OF_VC..OF_VC + LEN_VC, OF_VC + LEN_VC));
}

/// Whether the previous session closed cleanly.
pub fn check_vc(page: &Page) -> bool {
    page.read(|data| data[OF_VC..OF_VC + LEN_VC] == data[OF_VC + LEN_VC..OF_VC + 2 * LEN_VC])
}
