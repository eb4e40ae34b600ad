//! Free-space index over data pages.
//!
//! Pages are kept in buckets of `PAGE_SIZE / INTERVALS_NO` bytes of free
//! space. A page taken out by [`PageIndex::select`] is unavailable to other
//! inserts until it is added back.

use parking_lot::Mutex;

use crate::storage::{PageId, PAGE_SIZE};

const INTERVALS_NO: usize = 40;
const THRESHOLD: usize = PAGE_SIZE / INTERVALS_NO;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub page_id: PageId,
    pub free_space: usize,
}

pub struct PageIndex {
    lists: Mutex<Vec<Vec<PageInfo>>>,
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PageIndex {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(vec![Vec::new(); INTERVALS_NO + 1]),
        }
    }

    pub fn add(&self, page_id: PageId, free_space: usize) {
        let number = (free_space / THRESHOLD).min(INTERVALS_NO);
        self.lists.lock()[number].push(PageInfo {
            page_id,
            free_space,
        });
    }

    /// Remove and return a page with more than `space` bytes free.
    pub fn select(&self, space: usize) -> Option<PageInfo> {
        let mut number = space / THRESHOLD;
        if number < INTERVALS_NO {
            number += 1;
        }

        let mut lists = self.lists.lock();
        lists
            .iter_mut()
            .skip(number)
            .find(|list| !list.is_empty())
            .map(|list| list.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_picks_roomy_page() {
        let index = PageIndex::new();
        index.add(PageId(2), 100);
        index.add(PageId(3), 5000);

        let info = index.select(300).unwrap();
        assert_eq!(info.page_id, PageId(3));
        // Taken out until added back.
        assert_eq!(index.select(300), None);

        // The lowest bucket is never handed out.
        assert_eq!(index.select(10), None);
    }

    #[test]
    fn test_select_never_returns_too_small_page() {
        let index = PageIndex::new();
        index.add(PageId(2), THRESHOLD + 1);
        assert_eq!(index.select(THRESHOLD), None);
        assert!(index.select(THRESHOLD - 1).is_some());
    }

    #[test]
    fn test_full_page_bucket() {
        let index = PageIndex::new();
        let max = PAGE_SIZE - 2;
        index.add(PageId(5), max);
        assert_eq!(index.select(max).map(|i| i.page_id), Some(PageId(5)));
        assert_eq!(index.select(0), None);
    }

    #[test]
    fn test_same_bucket_is_fifo() {
        let index = PageIndex::new();
        index.add(PageId(2), 4000);
        index.add(PageId(3), 4001);
        assert_eq!(index.select(100).map(|i| i.page_id), Some(PageId(2)));
        assert_eq!(index.select(100).map(|i| i.page_id), Some(PageId(3)));
    }
}
