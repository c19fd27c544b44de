//! Dummy page generator.
//!
//! Produces pattern-filled pages on demand, as fast as the pool and the
//! rate limiter allow. Used for pipeline benchmarking and tests.

use std::sync::Arc;

use flux_common::config::EquipmentConfig;
use flux_common::units::parse_byte_size;
use flux_memory::{PagedPool, PageRef};

use crate::equipment::EquipmentSource;
use crate::error::ReadoutError;

/// Generates pages whose payload starts with a little-endian page
/// counter, the rest left untouched.
pub struct DummyGenerator {
    pool: Option<Arc<PagedPool>>,
    /// Payload bytes to mark as filled; `None` fills the whole page.
    payload_size: Option<usize>,
    pages_generated: u64,
}

impl DummyGenerator {
    pub fn from_config(cfg: &EquipmentConfig) -> Result<Self, ReadoutError> {
        let payload_size = match &cfg.dummy_payload_size {
            None => None,
            Some(s) => Some(parse_byte_size(s).ok_or_else(|| {
                ReadoutError::Config(format!("bad dummy_payload_size '{s}'"))
            })? as usize),
        };
        Ok(Self {
            pool: None,
            payload_size,
            pages_generated: 0,
        })
    }

    /// Direct constructor for tests and benches.
    pub fn with_payload_size(payload_size: Option<usize>) -> Self {
        Self {
            pool: None,
            payload_size,
            pages_generated: 0,
        }
    }
}

impl EquipmentSource for DummyGenerator {
    fn kind(&self) -> &'static str {
        "dummy"
    }

    fn init(&mut self, pool: &Arc<PagedPool>) -> Result<(), ReadoutError> {
        if let Some(size) = self.payload_size {
            if size > pool.usable_page_size() {
                return Err(ReadoutError::Config(format!(
                    "dummy_payload_size {size} exceeds page payload capacity {}",
                    pool.usable_page_size()
                )));
            }
        }
        self.pool = Some(Arc::clone(pool));
        Ok(())
    }

    fn next_block(&mut self) -> Option<PageRef> {
        let pool = self.pool.as_ref()?;
        let mut page = pool.acquire_block()?;

        let fill = self
            .payload_size
            .unwrap_or_else(|| pool.usable_page_size());
        self.pages_generated += 1;
        let counter = self.pages_generated;
        let payload = page.payload_mut();
        payload[..8].copy_from_slice(&counter.to_le_bytes());

        page.header_mut().data_size = fill as u32;
        Some(page)
    }
}
