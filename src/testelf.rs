//! Test-only builder for minimal ELF64 executables and input-parameter
//! payloads, shared by the image and registry tests.

use crate::symbol::SYMBOL_RECORD_LEN;
use goblin::elf::program_header::{PF_R, PF_W, PF_X};

const EHDR_LEN: usize = 64;
const PHDR_LEN: usize = 56;

/// One program-header-to-be in a test executable.
pub(crate) struct SegSpec {
    pub flags: u32,
    pub data: Vec<u8>,
    /// Extra zero-filled memory beyond the file payload (BSS-style tail).
    pub extra_mem: u64,
}

pub(crate) fn code_seg(data: Vec<u8>) -> SegSpec {
    SegSpec {
        flags: PF_R | PF_X,
        data,
        extra_mem: 0,
    }
}

pub(crate) fn data_seg(data: Vec<u8>) -> SegSpec {
    SegSpec {
        flags: PF_R | PF_W,
        data,
        extra_mem: 0,
    }
}

pub(crate) fn params_seg(symbols: &[(&str, u32, u32)]) -> SegSpec {
    SegSpec {
        flags: PF_R,
        data: params_payload(symbols),
        extra_mem: 0,
    }
}

/// Build an input-parameter segment payload: count word, records, and a
/// zero-filled data area exactly large enough for the declared storage.
pub(crate) fn params_payload(symbols: &[(&str, u32, u32)]) -> Vec<u8> {
    let align4 = |v: usize| (v + 3) & !3;
    let mut out = (symbols.len() as u32).to_le_bytes().to_vec();
    for &(name, size, vmem) in symbols {
        let mut rec = vec![0u8; SYMBOL_RECORD_LEN];
        rec[..name.len()].copy_from_slice(name.as_bytes());
        rec[64..68].copy_from_slice(&size.to_le_bytes());
        rec[68..72].copy_from_slice(&vmem.to_le_bytes());
        out.extend_from_slice(&rec);
    }
    let mut end = align4(out.len());
    for &(_, size, _) in symbols {
        end = align4(end + size as usize);
    }
    out.resize(end, 0);
    out
}

/// Assemble a minimal ELF64 little-endian executable whose PT_LOAD
/// program headers carry the given segments.
pub(crate) fn build_elf(segments: &[SegSpec]) -> Vec<u8> {
    let phnum = segments.len();
    let mut payload_off = EHDR_LEN + phnum * PHDR_LEN;

    let mut out = Vec::new();

    // ELF header.
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]); // magic, 64-bit, LE, v1
    out.extend_from_slice(&[0u8; 8]); // padding
    out.extend_from_slice(&2u16.to_le_bytes()); // e_type: EXEC
    out.extend_from_slice(&243u16.to_le_bytes()); // e_machine
    out.extend_from_slice(&1u32.to_le_bytes()); // e_version
    out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    out.extend_from_slice(&(EHDR_LEN as u64).to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHDR_LEN as u16).to_le_bytes()); // e_ehsize
    out.extend_from_slice(&(PHDR_LEN as u16).to_le_bytes()); // e_phentsize
    out.extend_from_slice(&(phnum as u16).to_le_bytes()); // e_phnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(out.len(), EHDR_LEN);

    // Program headers.
    for (i, seg) in segments.iter().enumerate() {
        let vaddr = 0x1_0000u64 * (i as u64 + 1);
        out.extend_from_slice(&1u32.to_le_bytes()); // p_type: PT_LOAD
        out.extend_from_slice(&seg.flags.to_le_bytes());
        out.extend_from_slice(&(payload_off as u64).to_le_bytes()); // p_offset
        out.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
        out.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
        out.extend_from_slice(&(seg.data.len() as u64).to_le_bytes()); // p_filesz
        out.extend_from_slice(&(seg.data.len() as u64 + seg.extra_mem).to_le_bytes()); // p_memsz
        out.extend_from_slice(&0x40u64.to_le_bytes()); // p_align
        payload_off += seg.data.len();
    }

    // Segment payloads, in declaration order.
    for seg in segments {
        out.extend_from_slice(&seg.data);
    }

    out
}
