//! Reference-counted page handles.
//!
//! A [`PageRef`] is the only way to touch pool memory. Cloning shares
//! ownership of the page; dropping the last handle returns the page to
//! its pool. Child handles carve tail bytes off a parent page and keep
//! the whole page alive until they drop.
//!
//! ## Write protocol
//!
//! The accessors hand out references into shared memory, so the usual
//! pipeline protocol applies: exactly one stage owns a page for writing
//! at any time, and handles are cloned only once the writing stage is
//! done. `header_mut`/`payload_mut` take `&mut self` to keep accidental
//! misuse loud, but the protocol is what makes the aliasing sound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flux_common::datablock::{DataBlockHeader, DATA_BLOCK_HEADER_SIZE};

use crate::pool::PagedPool;

/// Shared core of one outstanding page.
pub(crate) struct PageCore {
    pool: Arc<PagedPool>,
    index: u32,
    /// Next free offset for child carving, from the page base.
    tail: AtomicUsize,
}

// SAFETY: the page memory behind the core is accessed only through
// PageRef under the write protocol above; the core fields themselves are
// atomic or immutable.
unsafe impl Send for PageCore {}
unsafe impl Sync for PageCore {}

impl Drop for PageCore {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

/// Reference-counted handle to a page (or a child range of one).
///
/// The handle keeps its pool alive (`PageRef → PagedPool → MemoryBank`),
/// so backing memory outlives every outstanding reference.
#[derive(Clone)]
pub struct PageRef {
    core: Arc<PageCore>,
    /// Start of this handle's view, from the page base.
    offset: usize,
    /// View length in bytes.
    len: usize,
    child: bool,
}

impl PageRef {
    /// Handle over a freshly acquired full page. The view covers the
    /// payload area; the in-band header sits in front of it.
    pub(crate) fn new_full(pool: Arc<PagedPool>, index: u32) -> Self {
        let page_size = pool.page_size();
        Self {
            core: Arc::new(PageCore {
                pool,
                index,
                tail: AtomicUsize::new(DATA_BLOCK_HEADER_SIZE),
            }),
            offset: DATA_BLOCK_HEADER_SIZE,
            len: page_size - DATA_BLOCK_HEADER_SIZE,
            child: false,
        }
    }

    #[inline]
    fn page_base(&self) -> *mut u8 {
        self.core.pool.page_ptr(self.core.index).as_ptr()
    }

    /// In-band header of the owning page. For child handles this is the
    /// parent page's header.
    #[inline]
    pub fn header(&self) -> &DataBlockHeader {
        // SAFETY: the page base is 64-aligned (enforced by the bank
        // manager) and the page always starts with a DataBlockHeader;
        // concurrent writers are excluded by the write protocol.
        unsafe { &*(self.page_base() as *const DataBlockHeader) }
    }

    /// Mutable in-band header. See the write protocol on the type.
    #[inline]
    pub fn header_mut(&mut self) -> &mut DataBlockHeader {
        // SAFETY: as for header(); &mut self keeps single-handle misuse
        // visible at the call site.
        unsafe { &mut *(self.page_base() as *mut DataBlockHeader) }
    }

    /// Reset the in-band header for a page of this pool's geometry.
    pub(crate) fn init_header(&mut self) {
        let memory_size = self.core.pool.page_size() as u32;
        *self.header_mut() = DataBlockHeader::new(memory_size);
    }

    /// This handle's view of the page.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        // SAFETY: offset..offset+len lies within the page; writers are
        // excluded by the write protocol.
        unsafe { core::slice::from_raw_parts(self.page_base().add(self.offset), self.len) }
    }

    /// Mutable view. See the write protocol on the type.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for payload().
        unsafe { core::slice::from_raw_parts_mut(self.page_base().add(self.offset), self.len) }
    }

    /// Raw pointer to the start of the view (for transport parts).
    #[inline]
    pub fn payload_ptr(&self) -> *const u8 {
        // Not dereferenced here; the pointer stays valid while any clone
        // of this handle lives.
        unsafe { self.page_base().add(self.offset) }
    }

    /// View length in bytes.
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.len
    }

    /// Total bytes of the owning page.
    #[inline]
    pub fn memory_size(&self) -> usize {
        self.core.pool.page_size()
    }

    #[inline]
    pub fn is_child(&self) -> bool {
        self.child
    }

    #[inline]
    pub fn page_index(&self) -> u32 {
        self.core.index
    }

    /// Pool that issued the owning page.
    #[inline]
    pub fn pool(&self) -> &Arc<PagedPool> {
        &self.core.pool
    }

    /// Carve `len` bytes off the tail of the owning page into an
    /// independent handle. The child keeps the page alive; the page
    /// returns to the pool only after the parent handle and every child
    /// have dropped. Returns `None` when the remaining tail is too small.
    pub fn child_block(&self, len: usize) -> Option<PageRef> {
        let page_size = self.core.pool.page_size();
        let claimed = self
            .core
            .tail
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tail| {
                (tail + len <= page_size).then_some(tail + len)
            })
            .ok()?;
        Some(PageRef {
            core: Arc::clone(&self.core),
            offset: claimed,
            len,
            child: true,
        })
    }

    /// Remaining tail bytes available for child carving.
    pub fn tail_available(&self) -> usize {
        self.core.pool.page_size() - self.core.tail.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("pool", &self.core.pool.id())
            .field("page", &self.core.index)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("child", &self.child)
            .finish()
    }
}
