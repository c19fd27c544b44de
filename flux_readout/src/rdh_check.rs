//! RDH chain checking.
//!
//! An RDH-formatted page carries a chain of packets linked by
//! `offset_next_packet`. The checker walks the chain, requiring every
//! header to validate, the link id to stay constant, and every trigger
//! orbit to fall inside the page's timeframe window (wrap-aware). A zero
//! `offset_next_packet` terminates the walk; the first violation stops
//! checking for that page.

use flux_common::rdh::{RdhError, RdhView, RDH_SIZE};
use flux_common::throttle::LogThrottle;
use thiserror::Error;
use tracing::warn;

use crate::tf::orbit_in_window;

/// Fields extracted from the first RDH of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdhFirstInfo {
    pub link_id: u8,
    pub fee_id: u16,
    pub system_id: u8,
    pub cru_id: u16,
    pub end_point_id: u8,
    pub trigger_orbit: u32,
    pub heartbeat_orbit: u32,
}

/// Parse and validate the first RDH of a page.
pub fn first_rdh_info(payload: &[u8]) -> Result<RdhFirstInfo, RdhError> {
    let rdh = RdhView::parse(payload)?;
    rdh.validate()?;
    Ok(RdhFirstInfo {
        link_id: rdh.link_id(),
        fee_id: rdh.fee_id(),
        system_id: rdh.system_id(),
        cru_id: rdh.cru_id(),
        end_point_id: rdh.end_point_id(),
        trigger_orbit: rdh.trigger_orbit(),
        heartbeat_orbit: rdh.heartbeat_orbit(),
    })
}

/// First violation found while walking a page's RDH chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// An RDH in the chain failed validation.
    #[error("invalid RDH at page offset {offset}: {source}")]
    Invalid {
        /// Byte offset of the packet in the page payload.
        offset: usize,
        /// Validation failure.
        source: RdhError,
    },

    /// A packet carries a different link id than the first one.
    #[error("link id mismatch at page offset {offset}: {found} != {expected}")]
    LinkMismatch {
        offset: usize,
        expected: u8,
        found: u8,
    },

    /// A trigger orbit falls outside the page's timeframe window.
    #[error("orbit {orbit} outside timeframe window [{first}, {last}] at page offset {offset}")]
    OrbitOutsideTf {
        offset: usize,
        orbit: u32,
        first: u32,
        last: u32,
    },
}

/// Outcome of one chain walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    /// Packets visited before termination.
    pub packets: u32,
    /// First violation, if any. Packets after it were not checked.
    pub error: Option<ChainError>,
}

/// Walk the RDH chain of `payload`, checking every packet.
pub fn walk_chain(payload: &[u8], expected_link: u8, tf_window: Option<(u32, u32)>) -> ChainReport {
    let mut packets = 0u32;
    let mut offset = 0usize;

    while offset + RDH_SIZE <= payload.len() {
        // parse cannot fail: the length check just passed
        let Ok(rdh) = RdhView::parse(&payload[offset..]) else {
            break;
        };
        if let Err(source) = rdh.validate() {
            return ChainReport {
                packets,
                error: Some(ChainError::Invalid { offset, source }),
            };
        }
        if rdh.link_id() != expected_link {
            return ChainReport {
                packets,
                error: Some(ChainError::LinkMismatch {
                    offset,
                    expected: expected_link,
                    found: rdh.link_id(),
                }),
            };
        }
        if let Some((first, last)) = tf_window {
            let orbit = rdh.trigger_orbit();
            if !orbit_in_window(orbit, first, last) {
                return ChainReport {
                    packets,
                    error: Some(ChainError::OrbitOutsideTf {
                        offset,
                        orbit,
                        first,
                        last,
                    }),
                };
            }
        }
        packets += 1;
        let next = rdh.offset_next_packet();
        if next == 0 {
            break;
        }
        offset += next as usize;
    }

    ChainReport {
        packets,
        error: None,
    }
}

/// Per-equipment checker state: throttled logging and a capped hex dump
/// of the first failures.
pub struct RdhChecker {
    dump_remaining: u32,
    throttle: LogThrottle,
}

impl RdhChecker {
    pub fn new(dump_enabled: bool) -> Self {
        Self {
            dump_remaining: if dump_enabled { 4 } else { 0 },
            throttle: LogThrottle::new(std::time::Duration::from_secs(10)),
        }
    }

    /// Walk and check one page, logging violations (rate-limited).
    /// Returns the violation, if any.
    pub fn check_page(
        &mut self,
        equipment: &str,
        payload: &[u8],
        expected_link: u8,
        tf_window: Option<(u32, u32)>,
    ) -> Option<ChainError> {
        let report = walk_chain(payload, expected_link, tf_window);
        let error = report.error?;
        if let Some(suppressed) = self.throttle.allow() {
            warn!(
                equipment,
                packets = report.packets,
                suppressed,
                "RDH stream check failed: {error}"
            );
        }
        if self.dump_remaining > 0 {
            self.dump_remaining -= 1;
            let offset = match &error {
                ChainError::Invalid { offset, .. }
                | ChainError::LinkMismatch { offset, .. }
                | ChainError::OrbitOutsideTf { offset, .. } => *offset,
            };
            let end = (offset + RDH_SIZE).min(payload.len());
            warn!(equipment, offset, dump = ?&payload[offset..end], "failing RDH bytes");
        }
        Some(error)
    }
}
