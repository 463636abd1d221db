//! Symbol records carried in an executable's input-parameter segment.
//!
//! The toolchain that produces VPU executables emits a fixed-layout record
//! table at the start of the input-parameter segment, followed by the
//! backing storage for each symbol. Layout (all integers little-endian):
//!
//! ```text
//! offset 0x00  u32  symbol count
//! offset 0x04  count * 72-byte records:
//!                bytes  0..64  symbol name, NUL-padded
//!                bytes 64..68  u32 symbol size
//!                bytes 68..72  u32 VMEM address
//! then         per-symbol backing storage, each range aligned to 4 bytes,
//!              in record order
//! ```
//!
//! Symbol ids are dense (`0..count`) and assigned in record order. Firmware
//! binds task arguments by id, so this ordering is a stable external
//! contract.

use crate::error::{LoaderError, Result};

/// Maximum length of a symbol name, in bytes.
pub const MAX_SYMBOL_NAME_LEN: usize = 64;

/// Maximum number of symbols one executable may declare.
pub const MAX_SYMBOLS_PER_EXECUTABLE: usize = 128;

/// Size of one on-disk symbol record.
pub const SYMBOL_RECORD_LEN: usize = MAX_SYMBOL_NAME_LEN + 8;

/// Alignment of each symbol's backing storage within the segment buffer.
pub const SYMBOL_DATA_ALIGN: usize = 4;

/// One named location in an executable's parameter memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name, unique within its executable.
    pub name: String,
    /// Dense id in record order, stable for the image's lifetime.
    pub symbol_id: u16,
    /// Size of the symbol's backing storage in bytes.
    pub size: u32,
    /// Location in the accelerator's VMEM address space.
    pub vmem_addr: u32,
    /// Byte offset of the backing storage within the input-parameter
    /// segment buffer.
    pub buffer_offset: u64,
}

#[inline]
const fn align_data(off: usize) -> usize {
    (off + SYMBOL_DATA_ALIGN - 1) & !(SYMBOL_DATA_ALIGN - 1)
}

/// Parse the record table of an input-parameter segment payload.
///
/// Returns the symbols in record order plus the total backing-storage byte
/// count. An empty payload declares zero symbols.
pub fn parse_symbols(payload: &[u8]) -> Result<(Vec<Symbol>, u32)> {
    if payload.is_empty() {
        return Ok((Vec::new(), 0));
    }
    if payload.len() < 4 {
        return Err(LoaderError::InvalidFormat(
            "input-parameter segment shorter than its count word".into(),
        ));
    }
    let count = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    if count > MAX_SYMBOLS_PER_EXECUTABLE {
        return Err(LoaderError::ResourceExhausted(format!(
            "executable declares {count} symbols, limit is {MAX_SYMBOLS_PER_EXECUTABLE}"
        )));
    }

    let table_end = 4 + count * SYMBOL_RECORD_LEN;
    if payload.len() < table_end {
        return Err(LoaderError::InvalidFormat(format!(
            "symbol table truncated: need {table_end} bytes, segment has {}",
            payload.len()
        )));
    }

    let mut symbols = Vec::with_capacity(count);
    let mut total: u32 = 0;
    let mut data_off = align_data(table_end);

    for idx in 0..count {
        let rec = &payload[4 + idx * SYMBOL_RECORD_LEN..4 + (idx + 1) * SYMBOL_RECORD_LEN];
        let name_bytes = &rec[..MAX_SYMBOL_NAME_LEN];
        let name_len = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_SYMBOL_NAME_LEN);
        if name_len == 0 {
            return Err(LoaderError::InvalidFormat(format!(
                "symbol record {idx} has an empty name"
            )));
        }
        let name = std::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| {
                LoaderError::InvalidFormat(format!("symbol record {idx} name is not UTF-8"))
            })?
            .to_owned();

        if symbols.iter().any(|s: &Symbol| s.name == name) {
            return Err(LoaderError::InvalidFormat(format!(
                "duplicate symbol name \"{name}\""
            )));
        }

        let size = u32::from_le_bytes(rec[64..68].try_into().unwrap());
        let vmem_addr = u32::from_le_bytes(rec[68..72].try_into().unwrap());
        if size == 0 {
            return Err(LoaderError::InvalidFormat(format!(
                "symbol \"{name}\" declares zero size"
            )));
        }

        symbols.push(Symbol {
            name,
            symbol_id: idx as u16,
            size,
            vmem_addr,
            buffer_offset: data_off as u64,
        });
        total = total
            .checked_add(size)
            .ok_or_else(|| LoaderError::InvalidFormat("symbol sizes overflow u32".into()))?;
        data_off = align_data(data_off + size as usize);
    }

    // The backing storage declared by the records must actually fit in the
    // segment payload.
    if data_off > align_data(payload.len()) {
        return Err(LoaderError::InvalidFormat(format!(
            "symbol storage ends at {data_off:#x} but segment has only {:#x} bytes",
            payload.len()
        )));
    }

    Ok((symbols, total))
}
