//! Subtimeframe wire header.
//!
//! First part of every subtimeframe message. The struct is the wire
//! format: `#[repr(C)]`, little-endian fields, 40 bytes including the
//! trailing padding.

use static_assertions::const_assert_eq;

use crate::consts::UNDEFINED_TIMEFRAME_ID;

/// STF header size on the wire, in bytes.
pub const STF_HEADER_SIZE: usize = 40;

// StfHeader layout (repr(C), 40 bytes):
//   [0..8]   timeframe_id:    u64
//   [8..16]  run_number:      u64
//   [16]     system_id:       u8
//   [17]     link_id:         u8
//   [18..20] fee_id:          u16
//   [20..22] equipment_id:    u16
//   [22..24] (alignment padding)
//   [24..28] tf_orbit_first:  u32
//   [28..32] tf_orbit_last:   u32
//   [32]     is_rdh_format:   u8
//   [33]     last_tf_message: u8
//   [34..40] _pad:            [u8; 6]

/// Wire header prepended to every subtimeframe message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct StfHeader {
    pub timeframe_id: u64,
    pub run_number: u64,
    pub system_id: u8,
    pub link_id: u8,
    pub fee_id: u16,
    pub equipment_id: u16,
    pub tf_orbit_first: u32,
    pub tf_orbit_last: u32,
    pub is_rdh_format: u8,
    /// Nonzero on the last message of a timeframe.
    pub last_tf_message: u8,
    pub _pad: [u8; 6],
}

const_assert_eq!(core::mem::size_of::<StfHeader>(), STF_HEADER_SIZE);

impl Default for StfHeader {
    fn default() -> Self {
        Self {
            timeframe_id: UNDEFINED_TIMEFRAME_ID,
            run_number: 0,
            system_id: 0,
            link_id: 0,
            fee_id: 0,
            equipment_id: 0,
            tf_orbit_first: 0,
            tf_orbit_last: 0,
            is_rdh_format: 0,
            last_tf_message: 0,
            _pad: [0; 6],
        }
    }
}

impl StfHeader {
    /// Wire bytes of this header.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: StfHeader is repr(C) plain data of STF_HEADER_SIZE bytes.
        unsafe {
            core::slice::from_raw_parts(self as *const StfHeader as *const u8, STF_HEADER_SIZE)
        }
    }

    /// Reparse a header from wire bytes. Returns `None` when `bytes` is
    /// too short.
    pub fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < STF_HEADER_SIZE {
            return None;
        }
        let mut out = StfHeader::default();
        // SAFETY: both pointers cover STF_HEADER_SIZE bytes of plain data;
        // `out` is a local, so the ranges cannot overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                &mut out as *mut StfHeader as *mut u8,
                STF_HEADER_SIZE,
            );
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_reparse_identity() {
        let hdr = StfHeader {
            timeframe_id: 17,
            run_number: 505_000,
            system_id: 3,
            link_id: 11,
            fee_id: 600,
            equipment_id: 121,
            tf_orbit_first: 4096,
            tf_orbit_last: 4351,
            is_rdh_format: 1,
            last_tf_message: 1,
            _pad: [0; 6],
        };

        let bytes = hdr.as_bytes();
        assert_eq!(bytes.len(), STF_HEADER_SIZE);

        let back = StfHeader::read_from(bytes).unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn short_buffer_yields_none() {
        assert!(StfHeader::read_from(&[0u8; STF_HEADER_SIZE - 1]).is_none());
    }

    #[test]
    fn field_offsets_match_wire_layout() {
        assert_eq!(core::mem::offset_of!(StfHeader, timeframe_id), 0);
        assert_eq!(core::mem::offset_of!(StfHeader, run_number), 8);
        assert_eq!(core::mem::offset_of!(StfHeader, system_id), 16);
        assert_eq!(core::mem::offset_of!(StfHeader, link_id), 17);
        assert_eq!(core::mem::offset_of!(StfHeader, fee_id), 18);
        assert_eq!(core::mem::offset_of!(StfHeader, equipment_id), 20);
        assert_eq!(core::mem::offset_of!(StfHeader, tf_orbit_first), 24);
        assert_eq!(core::mem::offset_of!(StfHeader, tf_orbit_last), 28);
        assert_eq!(core::mem::offset_of!(StfHeader, is_rdh_format), 32);
        assert_eq!(core::mem::offset_of!(StfHeader, last_tf_message), 33);
    }
}
