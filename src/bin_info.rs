//! Firmware-facing executable descriptor ("bin info").
//!
//! The accelerator firmware receives one DMA address per executable: the
//! IOVA of this descriptor. Its layout is a fixed, versioned binary contract
//! and must stay stable across a deployment. All integers little-endian.
//!
//! ```text
//! offset 0x00  u32  magic "VBIN"
//! offset 0x04  u32  layout version
//! offset 0x08  3 * 16-byte segment records (code, data, input-params):
//!                u64 base IOVA (0 when the segment is absent)
//!                u32 aligned size in bytes
//!                u32 number of ELF segments packed into the buffer
//! offset 0x38  u32  symbol count
//! offset 0x3c  u32  total symbol storage bytes
//! offset 0x40  count * 16-byte symbol entries, in symbol-id order:
//!                u32 VMEM address
//!                u32 size
//!                u64 offset within the input-params buffer
//! ```

use crate::image::NUM_SEGMENT_KINDS;
use crate::symbol::Symbol;

/// Descriptor magic, "VBIN" read as a little-endian u32.
pub const BIN_INFO_MAGIC: u32 = u32::from_le_bytes(*b"VBIN");

/// Current descriptor layout version.
pub const BIN_INFO_VERSION: u32 = 1;

/// Offset of the per-segment record array.
pub const SEGMENTS_OFFSET: usize = 0x08;

/// Size of one per-segment record.
pub const SEGMENT_RECORD_LEN: usize = 16;

/// Offset of the symbol count word.
pub const SYMBOL_COUNT_OFFSET: usize = SEGMENTS_OFFSET + NUM_SEGMENT_KINDS * SEGMENT_RECORD_LEN;

/// Offset of the symbol entry array.
pub const SYMBOLS_OFFSET: usize = SYMBOL_COUNT_OFFSET + 8;

/// Size of one symbol entry.
pub const SYMBOL_ENTRY_LEN: usize = 16;

/// Per-segment summary packed into the descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentRecord {
    /// Base IOVA of the segment buffer, 0 when absent.
    pub iova: u64,
    /// Aligned size of the segment buffer in bytes.
    pub size: u32,
    /// Number of ELF segments packed into the buffer.
    pub num_segments: u32,
}

/// Total descriptor size for `count` symbols.
pub const fn packed_len(count: usize) -> usize {
    SYMBOLS_OFFSET + count * SYMBOL_ENTRY_LEN
}

/// Serialize the descriptor for one executable.
pub fn pack(
    segments: &[SegmentRecord; NUM_SEGMENT_KINDS],
    symbols: &[Symbol],
    symbol_bytes_total: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(packed_len(symbols.len()));
    out.extend_from_slice(&BIN_INFO_MAGIC.to_le_bytes());
    out.extend_from_slice(&BIN_INFO_VERSION.to_le_bytes());
    for seg in segments {
        out.extend_from_slice(&seg.iova.to_le_bytes());
        out.extend_from_slice(&seg.size.to_le_bytes());
        out.extend_from_slice(&seg.num_segments.to_le_bytes());
    }
    out.extend_from_slice(&(symbols.len() as u32).to_le_bytes());
    out.extend_from_slice(&symbol_bytes_total.to_le_bytes());
    for sym in symbols {
        out.extend_from_slice(&sym.vmem_addr.to_le_bytes());
        out.extend_from_slice(&sym.size.to_le_bytes());
        out.extend_from_slice(&sym.buffer_offset.to_le_bytes());
    }
    debug_assert_eq!(out.len(), packed_len(symbols.len()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets() {
        // Header is magic + version.
        assert_eq!(SEGMENTS_OFFSET, 8);

        // Three segment records follow.
        assert_eq!(SYMBOL_COUNT_OFFSET, 8 + 3 * 16);

        // Symbol entries start after count + total words.
        assert_eq!(SYMBOLS_OFFSET, 0x40);

        // Fixed part plus one entry per symbol.
        assert_eq!(packed_len(0), 0x40);
        assert_eq!(packed_len(3), 0x40 + 3 * 16);
    }

    #[test]
    fn packs_expected_bytes() {
        let segments = [
            SegmentRecord {
                iova: 0x4000_0000,
                size: 0x180,
                num_segments: 1,
            },
            SegmentRecord::default(),
            SegmentRecord {
                iova: 0x4000_0200,
                size: 0x100,
                num_segments: 2,
            },
        ];
        let symbols = vec![Symbol {
            name: "coeffs".into(),
            symbol_id: 0,
            size: 32,
            vmem_addr: 0x1000,
            buffer_offset: 0x4c,
        }];
        let packed = pack(&segments, &symbols, 32);

        assert_eq!(packed.len(), packed_len(1));
        assert_eq!(&packed[0..4], b"VBIN");
        assert_eq!(
            u32::from_le_bytes(packed[4..8].try_into().unwrap()),
            BIN_INFO_VERSION
        );

        // Code segment record.
        assert_eq!(
            u64::from_le_bytes(packed[8..16].try_into().unwrap()),
            0x4000_0000
        );
        assert_eq!(u32::from_le_bytes(packed[16..20].try_into().unwrap()), 0x180);

        // Absent data segment is all zeroes.
        assert!(packed[24..40].iter().all(|&b| b == 0));

        // Symbol count and total.
        let count_off = SYMBOL_COUNT_OFFSET;
        assert_eq!(
            u32::from_le_bytes(packed[count_off..count_off + 4].try_into().unwrap()),
            1
        );
        assert_eq!(
            u32::from_le_bytes(packed[count_off + 4..count_off + 8].try_into().unwrap()),
            32
        );

        // Symbol entry.
        let s = SYMBOLS_OFFSET;
        assert_eq!(
            u32::from_le_bytes(packed[s..s + 4].try_into().unwrap()),
            0x1000
        );
        assert_eq!(
            u32::from_le_bytes(packed[s + 4..s + 8].try_into().unwrap()),
            32
        );
        assert_eq!(
            u64::from_le_bytes(packed[s + 8..s + 16].try_into().unwrap()),
            0x4c
        );
    }
}
