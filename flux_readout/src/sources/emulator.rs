//! CRU emulator.
//!
//! Generates synthetic RDH packet streams the way a CRU endpoint would
//! deliver them: each page carries one link's packets, grouped in
//! heartbeat frames with increasing orbits. Links are served round-robin
//! so the downstream pipeline sees interleaved per-link streams.

use std::sync::Arc;

use flux_common::config::EquipmentConfig;
use flux_common::rdh::{Rdh, RDH_SIZE};
use flux_common::units::parse_byte_size;
use flux_memory::{PagedPool, PageRef};

use crate::equipment::EquipmentSource;
use crate::error::ReadoutError;

const DEFAULT_PACKET_PAYLOAD: usize = 192;
const DEFAULT_HBF_PER_PAGE: u32 = 4;
const PACKETS_PER_HBF: u32 = 2;

struct LinkState {
    link_id: u8,
    next_orbit: u32,
    packet_counter: u8,
}

/// Synthetic RDH stream generator.
pub struct CruEmulator {
    links: Vec<LinkState>,
    next_link: usize,
    cru_id: u16,
    system_id: u8,
    packet_payload: usize,
    hbf_per_page: u32,
    pool: Option<Arc<PagedPool>>,
}

impl CruEmulator {
    pub fn from_config(cfg: &EquipmentConfig) -> Result<Self, ReadoutError> {
        let packet_payload = match &cfg.emulator_packet_payload {
            None => DEFAULT_PACKET_PAYLOAD,
            Some(s) => parse_byte_size(s).ok_or_else(|| {
                ReadoutError::Config(format!("bad emulator_packet_payload '{s}'"))
            })? as usize,
        };
        let links = if cfg.emulator_links.is_empty() {
            vec![0]
        } else {
            cfg.emulator_links.clone()
        };
        Ok(Self::with_options(
            links,
            cfg.emulator_cru_id,
            cfg.emulator_system_id,
            packet_payload,
            cfg.emulator_hbf_per_page.unwrap_or(DEFAULT_HBF_PER_PAGE),
        ))
    }

    /// Direct constructor for tests.
    pub fn with_options(
        links: Vec<u8>,
        cru_id: u16,
        system_id: u8,
        packet_payload: usize,
        hbf_per_page: u32,
    ) -> Self {
        Self {
            links: links
                .into_iter()
                .map(|link_id| LinkState {
                    link_id,
                    next_orbit: 0,
                    packet_counter: 0,
                })
                .collect(),
            next_link: 0,
            cru_id,
            system_id,
            packet_payload,
            hbf_per_page: hbf_per_page.max(1),
            pool: None,
        }
    }

    fn packet_size(&self) -> usize {
        RDH_SIZE + self.packet_payload
    }

    fn page_data_size(&self) -> usize {
        self.packet_size() * (self.hbf_per_page * PACKETS_PER_HBF) as usize
    }
}

impl EquipmentSource for CruEmulator {
    fn kind(&self) -> &'static str {
        "emulator"
    }

    fn init(&mut self, pool: &Arc<PagedPool>) -> Result<(), ReadoutError> {
        if self.links.is_empty() {
            return Err(ReadoutError::Config("emulator needs at least one link".into()));
        }
        if self.page_data_size() > pool.usable_page_size() {
            return Err(ReadoutError::Config(format!(
                "emulator page content {} exceeds page payload capacity {}",
                self.page_data_size(),
                pool.usable_page_size()
            )));
        }
        self.pool = Some(Arc::clone(pool));
        Ok(())
    }

    fn next_block(&mut self) -> Option<PageRef> {
        let pool = self.pool.as_ref()?;
        let mut page = pool.acquire_block()?;

        let link_ix = self.next_link;
        self.next_link = (self.next_link + 1) % self.links.len();

        let packet_size = self.packet_size();
        let data_size = self.page_data_size();
        let cru_id = self.cru_id;
        let system_id = self.system_id;
        let packet_payload = self.packet_payload;
        let hbf_per_page = self.hbf_per_page;
        let link = &mut self.links[link_ix];

        let payload = page.payload_mut();
        let mut offset = 0usize;
        for _ in 0..hbf_per_page {
            let orbit = link.next_orbit;
            link.next_orbit = link.next_orbit.wrapping_add(1);
            for _ in 0..PACKETS_PER_HBF {
                let rdh = Rdh {
                    block_length: packet_size as u16,
                    fee_id: 100 + link.link_id as u16,
                    system_id,
                    offset_next_packet: packet_size as u16,
                    memory_size: packet_size as u16,
                    link_id: link.link_id,
                    packet_counter: link.packet_counter,
                    cru_id,
                    end_point_id: 0,
                    trigger_orbit: orbit,
                    heartbeat_orbit: orbit,
                    ..Rdh::default()
                };
                rdh.write_to(&mut payload[offset..]);
                // deterministic filler after the header
                payload[offset + RDH_SIZE..offset + packet_size]
                    .fill(link.packet_counter);
                link.packet_counter = link.packet_counter.wrapping_add(1);
                offset += packet_size;
            }
        }
        debug_assert_eq!(offset, data_size);

        let h = page.header_mut();
        h.data_size = data_size as u32;
        h.is_rdh_format = 1;
        Some(page)
    }
}
