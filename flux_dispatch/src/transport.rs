//! Downstream transport abstraction.
//!
//! The dispatcher emits multi-part messages whose parts point straight
//! into pool pages. Each part carries a release hold: either a plain
//! page handle or an accounting guard. The transport (or the in-process
//! consumer standing in for it) drops the part when the message is
//! acknowledged, which releases the page back to its pool.
//!
//! Zero-copy sends require the page memory to live inside a region the
//! transport knows about; [`UnmanagedRegion`] creates such a region as a
//! POSIX shared memory segment, which a [`MemoryBank`] then wraps so
//! pools can be carved from it.
//!
//! [`MemoryBank`]: flux_memory::MemoryBank

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd;
use tracing::info;

use flux_memory::PageRef;

use crate::accounting::TransitGuard;
use crate::error::DispatchError;

// ─── Message parts ──────────────────────────────────────────────────

/// What keeps the referenced page alive until the part is released.
pub enum PartHold {
    /// Plain page reference, released on drop.
    Page(PageRef),
    /// Accounting guard: page reference plus in-flight bookkeeping.
    Accounted(TransitGuard),
}

/// One part of an outgoing multi-part message. Points into memory owned
/// by the held page; dropping the part is the transport acknowledgment.
pub struct MessagePart {
    ptr: *const u8,
    len: usize,
    _hold: PartHold,
}

// SAFETY: the pointer targets page memory kept alive by the hold; parts
// move between the formatting, sending and consuming threads but are
// only read.
unsafe impl Send for MessagePart {}

impl MessagePart {
    /// Part over `len` bytes at `ptr`, kept alive by `hold`.
    ///
    /// `ptr` must point into memory owned by the page behind `hold`.
    pub fn new(ptr: *const u8, len: usize, hold: PartHold) -> Self {
        Self {
            ptr,
            len,
            _hold: hold,
        }
    }

    /// Part covering `page`'s view bytes `[start, start+len)`.
    pub fn from_page_range(page: &PageRef, start: usize, len: usize, hold: PartHold) -> Self {
        debug_assert!(start + len <= page.usable_size());
        // SAFETY: in-bounds offset of the page view; not dereferenced.
        let ptr = unsafe { page.payload_ptr().add(start) };
        Self::new(ptr, len, hold)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Wire bytes of this part.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: ptr/len cover live page memory held by _hold.
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// A complete multi-part message travelling through an in-process
/// transport. Dropping it acknowledges every part.
pub struct TransportMessage {
    pub parts: Vec<MessagePart>,
    outstanding: Option<Arc<AtomicU64>>,
}

impl TransportMessage {
    pub fn total_len(&self) -> usize {
        self.parts.iter().map(MessagePart::len).sum()
    }
}

impl Drop for TransportMessage {
    fn drop(&mut self) {
        if let Some(counter) = &self.outstanding {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

// ─── Transport trait ────────────────────────────────────────────────

/// Downstream messaging channel.
pub trait MessageTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Vectored send of one multi-part message. Returns the number of
    /// payload bytes accepted.
    fn send(&self, parts: Vec<MessagePart>) -> Result<usize, DispatchError>;

    /// Messages accepted but not yet acknowledged. Shutdown waits for
    /// this to reach zero before tearing down pools and banks.
    fn outstanding(&self) -> u64;
}

// ─── Unmanaged region ───────────────────────────────────────────────

/// A transport-registered memory region for zero-copy sends, backed by
/// a POSIX shared memory segment.
///
/// The segment is unlinked right after mapping: the mapping keeps it
/// alive, the name disappears from `/dev/shm`.
pub struct UnmanagedRegion {
    base: NonNull<u8>,
    len: usize,
    name: String,
}

// SAFETY: the region is plain memory; all access goes through banks and
// pools which enforce the page protocol.
unsafe impl Send for UnmanagedRegion {}
unsafe impl Sync for UnmanagedRegion {}

impl UnmanagedRegion {
    /// Create a region of `len` bytes named after `session`.
    pub fn create(session: &str, len: usize) -> Result<Self, DispatchError> {
        let name = format!("/flux_{session}_{}", std::process::id());
        let map_err = |source| DispatchError::Region { source };

        let fd = mman::shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(map_err)?;

        let result: Result<NonNull<u8>, DispatchError> = (|| {
            unistd::ftruncate(&fd, len as libc::off_t).map_err(map_err)?;
            let size = NonZeroUsize::new(len)
                .ok_or(DispatchError::Config("region size is zero".into()))?;
            // SAFETY: fresh fd of the right size, no existing mapping.
            let ptr = unsafe {
                mman::mmap(
                    None,
                    size,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    &fd,
                    0,
                )
                .map_err(map_err)?
            };
            Ok(NonNull::new(ptr.as_ptr() as *mut u8).expect("mmap returned null"))
        })();

        // name can go away immediately; the mapping holds the segment
        let _ = mman::shm_unlink(name.as_str());

        let base = result?;
        info!(region = %name, len, "unmanaged region created");
        Ok(Self { base, len, name })
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for UnmanagedRegion {
    fn drop(&mut self) {
        // SAFETY: base/len describe the mapping created in `create`.
        unsafe {
            let _ = mman::munmap(
                NonNull::new_unchecked(self.base.as_ptr() as *mut libc::c_void),
                self.len,
            );
        }
    }
}

// ─── Transports ─────────────────────────────────────────────────────

/// Counts and discards messages; every part is acknowledged on the spot.
#[derive(Default)]
pub struct NullTransport {
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl NullTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl MessageTransport for NullTransport {
    fn name(&self) -> &'static str {
        "drop"
    }

    fn send(&self, parts: Vec<MessagePart>) -> Result<usize, DispatchError> {
        let total: usize = parts.iter().map(MessagePart::len).sum();
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(total as u64, Ordering::Relaxed);
        drop(parts);
        Ok(total)
    }

    fn outstanding(&self) -> u64 {
        0
    }
}

/// In-process channel transport: messages queue to a consumer which
/// acknowledges them by dropping.
pub struct ChannelTransport {
    tx: SyncSender<TransportMessage>,
    outstanding: Arc<AtomicU64>,
}

impl ChannelTransport {
    /// Transport plus the consumer end. `capacity` bounds the in-flight
    /// queue; a full queue fails the send (the dispatcher drops and
    /// counts).
    pub fn new(capacity: usize) -> (Arc<Self>, Receiver<TransportMessage>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(capacity);
        (
            Arc::new(Self {
                tx,
                outstanding: Arc::new(AtomicU64::new(0)),
            }),
            rx,
        )
    }
}

impl MessageTransport for ChannelTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn send(&self, parts: Vec<MessagePart>) -> Result<usize, DispatchError> {
        let total: usize = parts.iter().map(MessagePart::len).sum();
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let msg = TransportMessage {
            parts,
            outstanding: Some(Arc::clone(&self.outstanding)),
        };
        match self.tx.try_send(msg) {
            Ok(()) => Ok(total),
            Err(TrySendError::Full(msg)) => {
                drop(msg); // drop decrements outstanding
                Err(DispatchError::SendFailed {
                    reason: "loopback queue full".into(),
                })
            }
            Err(TrySendError::Disconnected(msg)) => {
                drop(msg);
                Err(DispatchError::SendFailed {
                    reason: "loopback consumer gone".into(),
                })
            }
        }
    }

    fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }
}
