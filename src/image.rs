//! Executable image loading: ELF segment classification, DMA staging and
//! the per-image descriptor.
//!
//! A VPU executable arrives as an ELF blob. Its PT_LOAD program headers are
//! classified into three segment kinds and packed into one DMA buffer per
//! kind; the input-parameter segment additionally carries the symbol record
//! table (see `symbol`). Loading is all-or-nothing: every failure path
//! releases whatever was staged so far before returning.

use crate::bin_info::{self, SegmentRecord};
use crate::dma::{DmaAllocator, DmaBuffer, align_up};
use crate::error::{LoaderError, Result};
use crate::symbol::{Symbol, parse_symbols};
use goblin::elf::Elf;
use goblin::elf::program_header::{PF_W, PF_X, PT_LOAD};
use sha2::{Digest, Sha256};

/// Segment classes of a VPU executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Executable code.
    Code = 0,
    /// Writable data.
    Data = 1,
    /// Read-only input parameters, including the symbol record table.
    InputParams = 2,
}

pub const NUM_SEGMENT_KINDS: usize = 3;

/// Upper bound on the staged size of one segment buffer. ELF headers are
/// caller-supplied input; `p_memsz` must be checked against this before any
/// host allocation is sized from it.
pub const MAX_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

impl SegmentKind {
    pub const ALL: [SegmentKind; NUM_SEGMENT_KINDS] =
        [SegmentKind::Code, SegmentKind::Data, SegmentKind::InputParams];

    /// Classify an ELF program header by its permission flags.
    fn classify(p_flags: u32) -> SegmentKind {
        if p_flags & PF_X != 0 {
            SegmentKind::Code
        } else if p_flags & PF_W != 0 {
            SegmentKind::Data
        } else {
            SegmentKind::InputParams
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SegmentKind::Code => "code",
            SegmentKind::Data => "data",
            SegmentKind::InputParams => "in-params",
        }
    }
}

/// One populated segment buffer of a loaded image.
#[derive(Debug)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Number of ELF PT_LOAD segments packed into this buffer.
    pub num_segments: u32,
    pub buffer: DmaBuffer,
}

/// Staging area for one segment kind while the ELF is being parsed.
/// Holds payload on the host before any DMA allocation happens.
#[derive(Default)]
struct Staging {
    local: Vec<u8>,
    num_segments: u32,
}

impl Staging {
    /// Append one ELF segment's payload, aligned to the DMA granularity and
    /// zero-extended to its memory size.
    fn push(&mut self, payload: &[u8], mem_size: usize) {
        if !self.local.is_empty() {
            self.local.resize(align_up(self.local.len()), 0);
        }
        self.local.extend_from_slice(payload);
        if mem_size > payload.len() {
            let tail = mem_size - payload.len();
            self.local.resize(self.local.len() + tail, 0);
        }
        self.num_segments += 1;
    }
}

/// One fully loaded executable: segment buffers, symbol table and the
/// firmware descriptor. Immutable once built; the registry publishes it
/// behind an `Arc`.
#[derive(Debug)]
pub struct LoadedImage {
    id: u16,
    segments: [Option<Segment>; NUM_SEGMENT_KINDS],
    symbols: Vec<Symbol>,
    symbol_bytes_total: u32,
    bin_info: DmaBuffer,
}

impl LoadedImage {
    /// Parse `bytes` as a VPU executable and stage it into DMA buffers.
    ///
    /// On any error the buffers allocated so far are dropped, so the caller
    /// only has the slot reservation to roll back.
    pub(crate) fn from_elf(id: u16, bytes: &[u8], allocator: &dyn DmaAllocator) -> Result<Self> {
        if bytes.is_empty() {
            return Err(LoaderError::InvalidArgument(
                "empty executable buffer".into(),
            ));
        }
        let elf = Elf::parse(bytes)
            .map_err(|e| LoaderError::InvalidFormat(format!("ELF parse error: {e}")))?;
        if !elf.little_endian {
            return Err(LoaderError::InvalidFormat(
                "big-endian executables are not supported".into(),
            ));
        }

        let mut staging: [Staging; NUM_SEGMENT_KINDS] = Default::default();
        let mut loadable = 0u32;
        for ph in &elf.program_headers {
            if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
                continue;
            }
            // Header fields are untrusted input; bound the declared memory
            // size before it is cast or used to size any allocation.
            if ph.p_memsz > MAX_SEGMENT_SIZE as u64 {
                return Err(LoaderError::ResourceExhausted(format!(
                    "segment memory size {:#x} exceeds the {:#x}-byte segment cap",
                    ph.p_memsz, MAX_SEGMENT_SIZE
                )));
            }
            let file_size = ph.p_filesz as usize;
            let mem_size = ph.p_memsz as usize;
            let file_offset = ph.p_offset as usize;
            let end = file_offset
                .checked_add(file_size)
                .filter(|&end| end <= bytes.len())
                .ok_or_else(|| {
                    LoaderError::InvalidFormat(format!(
                        "segment at file offset {file_offset:#x} exceeds file bounds"
                    ))
                })?;
            if mem_size < file_size {
                return Err(LoaderError::InvalidFormat(format!(
                    "segment memory size {mem_size:#x} below file size {file_size:#x}"
                )));
            }
            let kind = SegmentKind::classify(ph.p_flags);
            // The same cap applies to the accumulated per-kind buffer.
            let staged = align_up(staging[kind as usize].local.len()) + mem_size;
            if staged > MAX_SEGMENT_SIZE {
                return Err(LoaderError::ResourceExhausted(format!(
                    "{} segments total {staged:#x} bytes, cap is {MAX_SEGMENT_SIZE:#x}",
                    kind.name()
                )));
            }
            staging[kind as usize].push(&bytes[file_offset..end], mem_size);
            loadable += 1;
        }
        if loadable == 0 {
            return Err(LoaderError::InvalidFormat("no loadable segments".into()));
        }

        let (symbols, symbol_bytes_total) =
            parse_symbols(&staging[SegmentKind::InputParams as usize].local)?;

        // DMA allocation and copy-in. Buffers are RAII; a failure here drops
        // every buffer allocated so far.
        let mut segments: [Option<Segment>; NUM_SEGMENT_KINDS] = [None, None, None];
        for kind in SegmentKind::ALL {
            let st = &staging[kind as usize];
            if st.local.is_empty() {
                continue;
            }
            let mut buffer = allocator.alloc(st.local.len())?;
            buffer.write(0, &st.local)?;
            segments[kind as usize] = Some(Segment {
                kind,
                num_segments: st.num_segments,
                buffer,
            });
        }

        // Firmware descriptor summarising segment addresses and symbols.
        let mut records = [SegmentRecord::default(); NUM_SEGMENT_KINDS];
        for kind in SegmentKind::ALL {
            if let Some(seg) = &segments[kind as usize] {
                records[kind as usize] = SegmentRecord {
                    iova: seg.buffer.iova(),
                    size: seg.buffer.aligned_size() as u32,
                    num_segments: seg.num_segments,
                };
            }
        }
        let packed = bin_info::pack(&records, &symbols, symbol_bytes_total);
        let mut bin_info = allocator.alloc(packed.len())?;
        bin_info.write(0, &packed)?;

        let digest = Sha256::digest(bytes);
        log::info!(
            "loaded executable {}: {} segment(s), {} symbol(s), sha256={}",
            id,
            loadable,
            symbols.len(),
            hex::encode(&digest[..8])
        );

        Ok(Self {
            id,
            segments,
            symbols,
            symbol_bytes_total,
            bin_info,
        })
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// IOVA of the firmware descriptor, the single address handed to the
    /// accelerator's command path for this executable.
    #[inline]
    pub fn bin_info_iova(&self) -> u64 {
        self.bin_info.iova()
    }

    /// Host view of the packed firmware descriptor.
    pub fn bin_info_bytes(&self) -> &[u8] {
        self.bin_info.bytes()
    }

    pub fn segment(&self, kind: SegmentKind) -> Option<&Segment> {
        self.segments[kind as usize].as_ref()
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbol_bytes_total(&self) -> u32 {
        self.symbol_bytes_total
    }

    /// Look a symbol up by name.
    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Look a symbol up by its dense id.
    pub fn symbol_by_id(&self, symbol_id: u16) -> Option<&Symbol> {
        self.symbols.get(symbol_id as usize)
    }

    /// Debug dump of the image's segment buffers.
    pub fn log_segments(&self) {
        for kind in SegmentKind::ALL {
            match &self.segments[kind as usize] {
                Some(seg) => log::debug!(
                    "exe {} {}: iova={:#x} size={:#x} ({} ELF segment(s))",
                    self.id,
                    kind.name(),
                    seg.buffer.iova(),
                    seg.buffer.aligned_size(),
                    seg.num_segments
                ),
                None => log::debug!("exe {} {}: absent", self.id, kind.name()),
            }
        }
    }
}
