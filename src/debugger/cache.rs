use crate::debugger::error::Error;
use crate::debugger::wire::proto::ReadResult;
use log::trace;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Page granularity cache of target memory.
///
/// The cache holds a snapshot of the target memory, so it is only valid
/// while the target is suspended. It must be disabled before the target resumes.
pub struct PageCache {
    page_size: u64,
    pages: LruCache<u64, Box<[u8]>>,
    enabled: bool,
}

impl PageCache {
    /// Create a new disabled [`PageCache`].
    ///
    /// # Arguments
    ///
    /// * `page_size`: page size in bytes, power of two
    /// * `max_pages`: maximum number of resident pages
    pub fn new(page_size: usize, max_pages: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            page_size: page_size as u64,
            pages: LruCache::new(NonZeroUsize::new(max_pages).unwrap_or(NonZeroUsize::MIN)),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Disable cache and drop all pages.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.pages.clear();
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size as usize
    }

    fn page_base(&self, addr: u64) -> u64 {
        addr & !(self.page_size - 1)
    }

    /// Read `len` bytes at `addr`.
    /// When enabled, only non resident pages are requested with `fetch`. A failed page is
    /// never stored, remaining pages are still read and the first failing address is reported.
    /// When disabled, the whole range is requested with a single `fetch`.
    pub fn read<F>(&mut self, addr: u64, len: usize, mut fetch: F) -> Result<ReadResult, Error>
    where
        F: FnMut(u64, usize) -> Result<ReadResult, Error>,
    {
        if !self.enabled {
            return fetch(addr, len);
        }
        if len == 0 {
            return Ok(ReadResult::Data(vec![]));
        }
        let Some(end) = addr.checked_add(len as u64) else {
            return Ok(ReadResult::Failed { address: addr });
        };

        let mut data = vec![0u8; len];
        let mut failed_at = None;
        let mut page = self.page_base(addr);
        while page < end {
            if !self.pages.contains(&page) {
                trace!(target: "debugger", "page cache miss at {page:#x}");
                match fetch(page, self.page_size as usize)? {
                    ReadResult::Data(bytes) => {
                        self.pages.put(page, bytes.into_boxed_slice());
                    }
                    ReadResult::Failed { .. } => {
                        failed_at.get_or_insert(page.max(addr));
                    }
                }
            }

            if let Some(bytes) = self.pages.get(&page) {
                let from = page.max(addr);
                let to = (page + self.page_size).min(end);
                let src = &bytes[(from - page) as usize..(to - page) as usize];
                let dst = (from - addr) as usize;
                data[dst..dst + src.len()].copy_from_slice(src);
            }

            match page.checked_add(self.page_size) {
                Some(next) => page = next,
                None => break,
            }
        }

        Ok(match failed_at {
            Some(address) => ReadResult::Failed { address },
            None => ReadResult::Data(data),
        })
    }

    /// Update resident pages after successful write into target memory.
    pub fn write_through(&mut self, addr: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let end = addr.saturating_add(data.len() as u64);
        let mut page = self.page_base(addr);
        while page < end {
            if let Some(bytes) = self.pages.peek_mut(&page) {
                let from = page.max(addr);
                let to = (page + self.page_size).min(end);
                let src = &data[(from - addr) as usize..(to - addr) as usize];
                let dst = (from - page) as usize;
                bytes[dst..dst + src.len()].copy_from_slice(src);
            }
            match page.checked_add(self.page_size) {
                Some(next) => page = next,
                None => break,
            }
        }
    }
}
