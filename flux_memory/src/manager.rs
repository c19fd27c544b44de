//! Bank registry and pool carving.
//!
//! The manager owns the map of named banks and hands out aligned,
//! non-overlapping slices of them to pool requests. Carved ranges are
//! kept for the lifetime of the manager: pools are long-lived process
//! structures, their slices are not recycled.

use std::ptr::NonNull;
use std::sync::Arc;

use flux_common::datablock::DATA_BLOCK_HEADER_SIZE;
use parking_lot::Mutex;
use tracing::info;

use crate::bank::MemoryBank;
use crate::error::{MemoryError, MemoryResult};
use crate::pool::PagedPool;

/// Minimum alignment of page starts, so in-band headers are always
/// naturally aligned.
const PAGE_ALIGN: usize = 64;

struct BankEntry {
    bank: Arc<MemoryBank>,
    /// Carved `(offset, len)` ranges, sorted by offset.
    carved: Vec<(usize, usize)>,
}

impl BankEntry {
    /// First-fit aligned free range of `len` bytes, if any.
    fn find_slot(&self, len: usize, align: usize) -> Option<usize> {
        let mut cursor = 0usize;
        for &(start, range_len) in &self.carved {
            let candidate = cursor.next_multiple_of(align);
            if candidate + len <= start {
                return Some(candidate);
            }
            cursor = start + range_len;
        }
        let candidate = cursor.next_multiple_of(align);
        (candidate + len <= self.bank.len()).then_some(candidate)
    }

    fn carve(&mut self, offset: usize, len: usize) {
        let pos = self
            .carved
            .partition_point(|&(start, _)| start < offset);
        self.carved.insert(pos, (offset, len));
    }
}

/// Registry of named memory banks.
#[derive(Default)]
pub struct MemoryBankManager {
    banks: Mutex<Vec<BankEntry>>,
}

impl MemoryBankManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bank. Names must be unique.
    pub fn add_bank(&self, bank: Arc<MemoryBank>) -> MemoryResult<()> {
        let mut banks = self.banks.lock();
        if banks.iter().any(|e| e.bank.name() == bank.name()) {
            return Err(MemoryError::BankAlreadyExists {
                name: bank.name().to_string(),
            });
        }
        info!(
            bank = bank.name(),
            size = bank.len(),
            owned = bank.is_owned(),
            "bank registered"
        );
        banks.push(BankEntry {
            bank,
            carved: Vec::new(),
        });
        Ok(())
    }

    /// Names of all registered banks, in registration order.
    pub fn bank_names(&self) -> Vec<String> {
        self.banks
            .lock()
            .iter()
            .map(|e| e.bank.name().to_string())
            .collect()
    }

    /// Carve a pool of `page_count` pages of `page_size` bytes from
    /// `bank_name` (or from the first bank with room when empty).
    ///
    /// The slice starts at a multiple of `block_align`; `first_page_offset`
    /// bytes are reserved in front of the first page.
    pub fn get_paged_pool(
        &self,
        page_size: usize,
        page_count: usize,
        bank_name: &str,
        first_page_offset: usize,
        block_align: usize,
    ) -> MemoryResult<Arc<PagedPool>> {
        if page_size == 0 || page_count == 0 {
            return Err(MemoryError::InvalidGeometry {
                page_size,
                page_count,
            });
        }
        if page_size <= DATA_BLOCK_HEADER_SIZE {
            return Err(MemoryError::PageTooSmall {
                page_size,
                header_size: DATA_BLOCK_HEADER_SIZE,
            });
        }
        if page_size % PAGE_ALIGN != 0 {
            return Err(MemoryError::Misaligned {
                what: "page size",
                value: page_size,
                align: PAGE_ALIGN,
            });
        }
        if first_page_offset % PAGE_ALIGN != 0 {
            return Err(MemoryError::Misaligned {
                what: "first page offset",
                value: first_page_offset,
                align: PAGE_ALIGN,
            });
        }
        let block_align = block_align.max(PAGE_ALIGN);
        if block_align % PAGE_ALIGN != 0 {
            return Err(MemoryError::Misaligned {
                what: "block alignment",
                value: block_align,
                align: PAGE_ALIGN,
            });
        }

        let total = first_page_offset + page_size * page_count;
        let mut banks = self.banks.lock();

        if !bank_name.is_empty() && !banks.iter().any(|e| e.bank.name() == bank_name) {
            return Err(MemoryError::BankNotFound {
                name: bank_name.to_string(),
            });
        }

        for entry in banks
            .iter_mut()
            .filter(|e| bank_name.is_empty() || e.bank.name() == bank_name)
        {
            if let Some(offset) = entry.find_slot(total, block_align) {
                entry.carve(offset, total);
                // SAFETY: offset + total lies inside the bank range just
                // checked by find_slot.
                let base = unsafe {
                    NonNull::new_unchecked(
                        entry
                            .bank
                            .base_ptr()
                            .as_ptr()
                            .add(offset + first_page_offset),
                    )
                };
                info!(
                    bank = entry.bank.name(),
                    offset,
                    page_size,
                    page_count,
                    first_page_offset,
                    "pool carved"
                );
                return Ok(PagedPool::new(
                    Arc::clone(&entry.bank),
                    base,
                    page_size,
                    page_count,
                ));
            }
        }

        Err(MemoryError::NoSpace {
            size: total,
            align: block_align,
        })
    }
}

impl std::fmt::Debug for MemoryBankManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBankManager")
            .field("banks", &self.bank_names())
            .finish()
    }
}
