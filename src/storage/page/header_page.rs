use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};

// Record layout: 32-byte zero-padded name followed by a u32 root page id.
// The record count lives in the first four bytes of the page.
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;
const COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// The header page (page 1) maps index names to their root page ids so an
/// index can find its root again after a restart.
pub struct HeaderPage;

impl HeaderPage {
    pub fn init(page: &mut Page) {
        page.data.fill(0);
        Self::set_record_count(page, 0);
    }

    /// Register a new name. Fails if the name is taken, too long, or the
    /// directory is full.
    pub fn insert_record(page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        if name.len() > NAME_SIZE || name.is_empty() {
            return false;
        }
        if Self::find_record(page, name).is_some() {
            return false;
        }
        let count = Self::record_count(page);
        if count as usize >= MAX_RECORDS {
            return false;
        }

        let offset = RECORDS_OFFSET + count as usize * RECORD_SIZE;
        page.data[offset..offset + NAME_SIZE].fill(0);
        page.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_u32(&mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE], root_page_id);
        Self::set_record_count(page, count + 1);
        true
    }

    /// Point an existing name at a new root page.
    pub fn update_record(page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        match Self::find_record(page, name) {
            Some(idx) => {
                let offset = RECORDS_OFFSET + idx * RECORD_SIZE;
                LittleEndian::write_u32(
                    &mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE],
                    root_page_id,
                );
                true
            }
            None => false,
        }
    }

    pub fn get_root_id(page: &Page, name: &str) -> Option<PageId> {
        let idx = Self::find_record(page, name)?;
        let offset = RECORDS_OFFSET + idx * RECORD_SIZE;
        Some(LittleEndian::read_u32(&page.data[offset + NAME_SIZE..offset + RECORD_SIZE]))
    }

    /// Remove a name, shifting later records down.
    pub fn delete_record(page: &mut Page, name: &str) -> bool {
        let idx = match Self::find_record(page, name) {
            Some(idx) => idx,
            None => return false,
        };
        let count = Self::record_count(page) as usize;
        let from = RECORDS_OFFSET + (idx + 1) * RECORD_SIZE;
        let to = RECORDS_OFFSET + count * RECORD_SIZE;
        let dst = RECORDS_OFFSET + idx * RECORD_SIZE;
        page.data.copy_within(from..to, dst);
        Self::set_record_count(page, (count - 1) as u32);
        true
    }

    pub fn record_count(page: &Page) -> u32 {
        LittleEndian::read_u32(&page.data[COUNT_OFFSET..COUNT_OFFSET + 4])
    }

    fn set_record_count(page: &mut Page, count: u32) {
        LittleEndian::write_u32(&mut page.data[COUNT_OFFSET..COUNT_OFFSET + 4], count);
    }

    fn find_record(page: &Page, name: &str) -> Option<usize> {
        let count = Self::record_count(page) as usize;
        let mut name_bytes = [0u8; NAME_SIZE];
        if name.len() > NAME_SIZE {
            return None;
        }
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());

        (0..count).find(|&i| {
            let offset = RECORDS_OFFSET + i * RECORD_SIZE;
            page.data[offset..offset + NAME_SIZE] == name_bytes
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::HEADER_PAGE_ID;

    #[test]
    fn test_insert_get_update_delete() {
        let mut page = Page::new(HEADER_PAGE_ID);
        HeaderPage::init(&mut page);

        assert!(HeaderPage::insert_record(&mut page, "orders_pk", 7));
        assert!(HeaderPage::insert_record(&mut page, "users_pk", 9));
        assert!(!HeaderPage::insert_record(&mut page, "orders_pk", 11));

        assert_eq!(HeaderPage::get_root_id(&page, "orders_pk"), Some(7));
        assert_eq!(HeaderPage::get_root_id(&page, "missing"), None);

        assert!(HeaderPage::update_record(&mut page, "orders_pk", 42));
        assert_eq!(HeaderPage::get_root_id(&page, "orders_pk"), Some(42));
        assert!(!HeaderPage::update_record(&mut page, "missing", 1));

        assert!(HeaderPage::delete_record(&mut page, "orders_pk"));
        assert_eq!(HeaderPage::get_root_id(&page, "orders_pk"), None);
        assert_eq!(HeaderPage::get_root_id(&page, "users_pk"), Some(9));
        assert_eq!(HeaderPage::record_count(&page), 1);
    }

    #[test]
    fn test_name_length_limit() {
        let mut page = Page::new(HEADER_PAGE_ID);
        HeaderPage::init(&mut page);

        let long_name = "x".repeat(33);
        assert!(!HeaderPage::insert_record(&mut page, &long_name, 1));
        assert!(HeaderPage::insert_record(&mut page, &"y".repeat(32), 1));
    }
}
