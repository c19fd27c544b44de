//! File replay source.
//!
//! Preloads a file at init and replays it chunk by chunk, one chunk per
//! page. At end of file the player either stops producing or restarts
//! from the beginning (`player_loop`).

use std::sync::Arc;

use flux_common::config::EquipmentConfig;
use flux_memory::{PagedPool, PageRef};
use tracing::info;

use crate::equipment::EquipmentSource;
use crate::error::ReadoutError;

/// Replays a preloaded file into pages.
pub struct FilePlayer {
    path: String,
    data: Vec<u8>,
    cursor: usize,
    loop_playback: bool,
    pool: Option<Arc<PagedPool>>,
}

impl FilePlayer {
    pub fn from_config(cfg: &EquipmentConfig) -> Result<Self, ReadoutError> {
        let path = cfg
            .player_file
            .clone()
            .ok_or_else(|| ReadoutError::Config("player_file not set".into()))?;
        Ok(Self {
            path,
            data: Vec::new(),
            cursor: 0,
            loop_playback: cfg.player_loop,
            pool: None,
        })
    }

    /// Direct constructor for tests.
    pub fn from_path(path: impl Into<String>, loop_playback: bool) -> Self {
        Self {
            path: path.into(),
            data: Vec::new(),
            cursor: 0,
            loop_playback,
            pool: None,
        }
    }
}

impl EquipmentSource for FilePlayer {
    fn kind(&self) -> &'static str {
        "player"
    }

    fn init(&mut self, pool: &Arc<PagedPool>) -> Result<(), ReadoutError> {
        self.data = std::fs::read(&self.path)?;
        if self.data.is_empty() {
            return Err(ReadoutError::Config(format!(
                "player file '{}' is empty",
                self.path
            )));
        }
        info!(
            file = %self.path,
            bytes = self.data.len(),
            loop_playback = self.loop_playback,
            "player file preloaded"
        );
        self.pool = Some(Arc::clone(pool));
        Ok(())
    }

    fn next_block(&mut self) -> Option<PageRef> {
        if self.cursor >= self.data.len() {
            if !self.loop_playback {
                return None;
            }
            self.cursor = 0;
        }

        let pool = self.pool.as_ref()?;
        let mut page = pool.acquire_block()?;

        let chunk_len = (self.data.len() - self.cursor).min(page.usable_size());
        let chunk = &self.data[self.cursor..self.cursor + chunk_len];
        page.payload_mut()[..chunk_len].copy_from_slice(chunk);
        page.header_mut().data_size = chunk_len as u32;
        self.cursor += chunk_len;
        Some(page)
    }

    fn memory_usage(&self) -> usize {
        self.data.len()
    }
}
