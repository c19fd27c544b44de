//! RDH (raw data header) wire format.
//!
//! The RDH is the hardware-defined per-packet header embedded in the
//! payload of RDH-formatted pages. All fields are little-endian. Parsing
//! goes through [`RdhView`], a zero-copy accessor over raw page bytes;
//! [`Rdh`] is the owned form used to synthesize packet streams (CRU
//! emulator, tests).

use thiserror::Error;

/// RDH size on the wire, in bytes.
pub const RDH_SIZE: usize = 64;

// RDH field offsets (little-endian):
//   [0]      version:            u8
//   [1]      header_size:        u8   (= 64)
//   [2..4]   block_length:       u16
//   [4..6]   fee_id:             u16
//   [6]      priority:           u8   (unused)
//   [7]      system_id:          u8
//   [8..10]  offset_next_packet: u16
//   [10..12] memory_size:        u16
//   [12]     link_id:            u8
//   [13]     packet_counter:     u8   (parsed, contiguity not checked)
//   [14..16] cru_id:12 | end_point_id:4
//   [16..20] trigger_orbit:      u32
//   [20..24] heartbeat_orbit:    u32
//   [24..64] trigger/detector fields (unused here)

const OFF_VERSION: usize = 0;
const OFF_HEADER_SIZE: usize = 1;
const OFF_BLOCK_LENGTH: usize = 2;
const OFF_FEE_ID: usize = 4;
const OFF_SYSTEM_ID: usize = 7;
const OFF_NEXT_PACKET: usize = 8;
const OFF_MEMORY_SIZE: usize = 10;
const OFF_LINK_ID: usize = 12;
const OFF_PACKET_COUNTER: usize = 13;
const OFF_CRU_ENDPOINT: usize = 14;
const OFF_TRIGGER_ORBIT: usize = 16;
const OFF_HEARTBEAT_ORBIT: usize = 20;

/// Supported RDH versions.
const RDH_VERSION_MIN: u8 = 3;
const RDH_VERSION_MAX: u8 = 7;

/// Errors raised while parsing or validating an RDH.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RdhError {
    /// Not enough bytes left in the page for a full RDH.
    #[error("truncated RDH: {len} bytes available, {RDH_SIZE} required")]
    Truncated {
        /// Bytes available at the packet offset.
        len: usize,
    },

    /// Version outside the supported range.
    #[error("unsupported RDH version {version}")]
    UnsupportedVersion {
        /// Version byte read from the wire.
        version: u8,
    },

    /// Header size field does not match the wire format.
    #[error("bad RDH header size {size}, expected {RDH_SIZE}")]
    BadHeaderSize {
        /// Header size byte read from the wire.
        size: u8,
    },

    /// `offset_next_packet` points inside the header.
    #[error("bad RDH offset_next_packet {offset}")]
    BadNextPacketOffset {
        /// Offset read from the wire.
        offset: u16,
    },

    /// `memory_size` smaller than the header itself.
    #[error("bad RDH memory size {size}")]
    BadMemorySize {
        /// Memory size read from the wire.
        size: u16,
    },
}

#[inline]
fn read_u16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

#[inline]
fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

/// Zero-copy accessor over one RDH inside a page.
#[derive(Debug, Clone, Copy)]
pub struct RdhView<'a> {
    bytes: &'a [u8],
}

impl<'a> RdhView<'a> {
    /// Bind a view to the first [`RDH_SIZE`] bytes of `bytes`.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, RdhError> {
        if bytes.len() < RDH_SIZE {
            return Err(RdhError::Truncated { len: bytes.len() });
        }
        Ok(Self { bytes })
    }

    /// Validate the fixed fields of this RDH.
    pub fn validate(&self) -> Result<(), RdhError> {
        let version = self.version();
        if !(RDH_VERSION_MIN..=RDH_VERSION_MAX).contains(&version) {
            return Err(RdhError::UnsupportedVersion { version });
        }
        let size = self.header_size();
        if size as usize != RDH_SIZE {
            return Err(RdhError::BadHeaderSize { size });
        }
        let next = self.offset_next_packet();
        if next != 0 && (next as usize) < RDH_SIZE {
            return Err(RdhError::BadNextPacketOffset { offset: next });
        }
        let mem = self.memory_size();
        if mem != 0 && (mem as usize) < RDH_SIZE {
            return Err(RdhError::BadMemorySize { size: mem });
        }
        Ok(())
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.bytes[OFF_VERSION]
    }

    #[inline]
    pub fn header_size(&self) -> u8 {
        self.bytes[OFF_HEADER_SIZE]
    }

    #[inline]
    pub fn block_length(&self) -> u16 {
        read_u16(self.bytes, OFF_BLOCK_LENGTH)
    }

    #[inline]
    pub fn fee_id(&self) -> u16 {
        read_u16(self.bytes, OFF_FEE_ID)
    }

    #[inline]
    pub fn system_id(&self) -> u8 {
        self.bytes[OFF_SYSTEM_ID]
    }

    #[inline]
    pub fn offset_next_packet(&self) -> u16 {
        read_u16(self.bytes, OFF_NEXT_PACKET)
    }

    #[inline]
    pub fn memory_size(&self) -> u16 {
        read_u16(self.bytes, OFF_MEMORY_SIZE)
    }

    #[inline]
    pub fn link_id(&self) -> u8 {
        self.bytes[OFF_LINK_ID]
    }

    #[inline]
    pub fn packet_counter(&self) -> u8 {
        self.bytes[OFF_PACKET_COUNTER]
    }

    #[inline]
    pub fn cru_id(&self) -> u16 {
        read_u16(self.bytes, OFF_CRU_ENDPOINT) & 0x0FFF
    }

    #[inline]
    pub fn end_point_id(&self) -> u8 {
        (read_u16(self.bytes, OFF_CRU_ENDPOINT) >> 12) as u8
    }

    #[inline]
    pub fn trigger_orbit(&self) -> u32 {
        read_u32(self.bytes, OFF_TRIGGER_ORBIT)
    }

    #[inline]
    pub fn heartbeat_orbit(&self) -> u32 {
        read_u32(self.bytes, OFF_HEARTBEAT_ORBIT)
    }

    /// One-line summary used by debug dumps.
    pub fn summary(&self) -> String {
        format!(
            "RDH v{} hdr={} fee={} link={} cru={}/{} hbOrbit={} trgOrbit={} next={}",
            self.version(),
            self.header_size(),
            self.fee_id(),
            self.link_id(),
            self.cru_id(),
            self.end_point_id(),
            self.heartbeat_orbit(),
            self.trigger_orbit(),
            self.offset_next_packet(),
        )
    }
}

/// Equipment id derived from CRU id and endpoint. Zero means undefined.
#[inline]
pub fn equipment_id_from_cru(cru_id: u16, end_point_id: u8) -> u16 {
    cru_id * 10 + end_point_id as u16
}

/// Owned RDH, used to synthesize packet streams.
#[derive(Debug, Clone, Copy)]
pub struct Rdh {
    pub version: u8,
    pub block_length: u16,
    pub fee_id: u16,
    pub system_id: u8,
    pub offset_next_packet: u16,
    pub memory_size: u16,
    pub link_id: u8,
    pub packet_counter: u8,
    pub cru_id: u16,
    pub end_point_id: u8,
    pub trigger_orbit: u32,
    pub heartbeat_orbit: u32,
}

impl Default for Rdh {
    fn default() -> Self {
        Self {
            version: 6,
            block_length: RDH_SIZE as u16,
            fee_id: 0,
            system_id: 0,
            offset_next_packet: 0,
            memory_size: RDH_SIZE as u16,
            link_id: 0,
            packet_counter: 0,
            cru_id: 0,
            end_point_id: 0,
            trigger_orbit: 0,
            heartbeat_orbit: 0,
        }
    }
}

impl Rdh {
    /// Serialize into the first [`RDH_SIZE`] bytes of `out`.
    ///
    /// # Panics
    /// Panics if `out` is shorter than [`RDH_SIZE`].
    pub fn write_to(&self, out: &mut [u8]) {
        assert!(out.len() >= RDH_SIZE, "RDH target buffer too short");
        out[..RDH_SIZE].fill(0);
        out[OFF_VERSION] = self.version;
        out[OFF_HEADER_SIZE] = RDH_SIZE as u8;
        out[OFF_BLOCK_LENGTH..OFF_BLOCK_LENGTH + 2].copy_from_slice(&self.block_length.to_le_bytes());
        out[OFF_FEE_ID..OFF_FEE_ID + 2].copy_from_slice(&self.fee_id.to_le_bytes());
        out[OFF_SYSTEM_ID] = self.system_id;
        out[OFF_NEXT_PACKET..OFF_NEXT_PACKET + 2]
            .copy_from_slice(&self.offset_next_packet.to_le_bytes());
        out[OFF_MEMORY_SIZE..OFF_MEMORY_SIZE + 2].copy_from_slice(&self.memory_size.to_le_bytes());
        out[OFF_LINK_ID] = self.link_id;
        out[OFF_PACKET_COUNTER] = self.packet_counter;
        let cru_ep = (self.cru_id & 0x0FFF) | ((self.end_point_id as u16) << 12);
        out[OFF_CRU_ENDPOINT..OFF_CRU_ENDPOINT + 2].copy_from_slice(&cru_ep.to_le_bytes());
        out[OFF_TRIGGER_ORBIT..OFF_TRIGGER_ORBIT + 4]
            .copy_from_slice(&self.trigger_orbit.to_le_bytes());
        out[OFF_HEARTBEAT_ORBIT..OFF_HEARTBEAT_ORBIT + 4]
            .copy_from_slice(&self.heartbeat_orbit.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Rdh {
        Rdh {
            version: 6,
            block_length: 256,
            fee_id: 42,
            system_id: 3,
            offset_next_packet: 256,
            memory_size: 256,
            link_id: 7,
            packet_counter: 9,
            cru_id: 12,
            end_point_id: 1,
            trigger_orbit: 1_000_000,
            heartbeat_orbit: 1_000_000,
        }
    }

    #[test]
    fn write_then_parse_preserves_fields() {
        let rdh = sample();
        let mut buf = [0u8; RDH_SIZE];
        rdh.write_to(&mut buf);

        let view = RdhView::parse(&buf).unwrap();
        view.validate().unwrap();
        assert_eq!(view.version(), 6);
        assert_eq!(view.block_length(), 256);
        assert_eq!(view.fee_id(), 42);
        assert_eq!(view.system_id(), 3);
        assert_eq!(view.offset_next_packet(), 256);
        assert_eq!(view.memory_size(), 256);
        assert_eq!(view.link_id(), 7);
        assert_eq!(view.packet_counter(), 9);
        assert_eq!(view.cru_id(), 12);
        assert_eq!(view.end_point_id(), 1);
        assert_eq!(view.trigger_orbit(), 1_000_000);
        assert_eq!(view.heartbeat_orbit(), 1_000_000);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let buf = [0u8; RDH_SIZE - 1];
        assert!(matches!(
            RdhView::parse(&buf),
            Err(RdhError::Truncated { len }) if len == RDH_SIZE - 1
        ));
    }

    #[test]
    fn validation_rejects_bad_fields() {
        let mut buf = [0u8; RDH_SIZE];

        let mut rdh = sample();
        rdh.version = 2;
        rdh.write_to(&mut buf);
        let view = RdhView::parse(&buf).unwrap();
        assert_eq!(view.validate(), Err(RdhError::UnsupportedVersion { version: 2 }));

        let rdh = sample();
        rdh.write_to(&mut buf);
        buf[1] = 32; // corrupt header size
        let view = RdhView::parse(&buf).unwrap();
        assert_eq!(view.validate(), Err(RdhError::BadHeaderSize { size: 32 }));

        let mut rdh = sample();
        rdh.offset_next_packet = 10;
        rdh.write_to(&mut buf);
        let view = RdhView::parse(&buf).unwrap();
        assert_eq!(
            view.validate(),
            Err(RdhError::BadNextPacketOffset { offset: 10 })
        );
    }

    #[test]
    fn cru_equipment_id() {
        assert_eq!(equipment_id_from_cru(12, 1), 121);
        assert_eq!(equipment_id_from_cru(0, 0), 0);
    }

    #[test]
    fn zeroed_rdh_fails_validation() {
        let buf = [0u8; RDH_SIZE];
        let view = RdhView::parse(&buf).unwrap();
        assert!(view.validate().is_err());
    }
}
