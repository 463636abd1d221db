//! DMA-capable buffer management.
//!
//! The accelerator reaches host memory through an IO address space (IOVA).
//! `DmaAllocator` is the seam to a real IOMMU mapping layer; the bundled
//! `HostDmaAllocator` carves IOVAs out of a fixed window and backs them with
//! host heap memory, which is sufficient for software-only deployments and
//! tests.

use crate::error::{LoaderError, Result};
use std::sync::{Arc, Mutex};

/// Addressing granularity of the accelerator's DMA engine, in bytes.
/// Segment buffers and IOVA assignments are rounded up to this.
pub const DMA_ALIGN: usize = 64;

/// Default base of the IOVA window handed to `HostDmaAllocator::new`.
pub const DMA_WINDOW_BASE: u64 = 0x4000_0000;

/// Default size of the IOVA window (64 MiB).
pub const DMA_WINDOW_SIZE: u64 = 64 * 1024 * 1024;

/// Round `size` up to the DMA addressing granularity.
#[inline]
pub const fn align_up(size: usize) -> usize {
    (size + DMA_ALIGN - 1) & !(DMA_ALIGN - 1)
}

/// Allocator for buffers visible to both the host CPU and the accelerator's
/// DMA engine.
///
/// Allocation is all-or-nothing: on success the returned buffer has a valid
/// IOVA and host mapping of at least the requested size; on failure nothing
/// is retained.
pub trait DmaAllocator: Send + Sync {
    /// Allocate a zero-initialised buffer of at least `size` bytes, rounded
    /// up to `DMA_ALIGN`.
    fn alloc(&self, size: usize) -> Result<DmaBuffer>;
}

/// One DMA-visible allocation: host bytes plus the IOVA the accelerator
/// uses to reach them. Dropping the buffer returns its IOVA range to the
/// owning window.
pub struct DmaBuffer {
    iova: u64,
    requested: usize,
    data: Vec<u8>,
    window: Option<Arc<WindowInner>>,
}

impl DmaBuffer {
    /// IO address of the buffer as seen by the accelerator.
    #[inline]
    pub fn iova(&self) -> u64 {
        self.iova
    }

    /// Size originally requested by the caller.
    #[inline]
    pub fn requested_size(&self) -> usize {
        self.requested
    }

    /// Actual (aligned) size of the backing allocation.
    #[inline]
    pub fn aligned_size(&self) -> usize {
        self.data.len()
    }

    /// Host-visible contents.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable host-visible contents.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy `src` into the buffer starting at `offset`.
    pub fn write(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(src.len())
            .ok_or_else(|| LoaderError::InvalidArgument("buffer write overflow".into()))?;
        if end > self.data.len() {
            return Err(LoaderError::InvalidArgument(format!(
                "write of {} bytes at offset {:#x} exceeds buffer of {:#x} bytes",
                src.len(),
                offset,
                self.data.len()
            )));
        }
        self.data[offset..end].copy_from_slice(src);
        Ok(())
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if let Some(window) = self.window.take() {
            window.release(self.iova, self.data.len() as u64);
        }
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("iova", &format_args!("{:#x}", self.iova))
            .field("requested", &self.requested)
            .field("aligned", &self.data.len())
            .finish()
    }
}

/// Free-range bookkeeping for one IOVA window, shared with the buffers it
/// hands out so that drops can return their ranges.
struct WindowInner {
    base: u64,
    size: u64,
    /// Sorted, non-overlapping `(start, len)` free ranges.
    free: Mutex<Vec<(u64, u64)>>,
}

impl WindowInner {
    /// First-fit carve of `len` bytes out of the free list.
    fn carve(&self, len: u64) -> Option<u64> {
        let mut free = self.free.lock().unwrap();
        for i in 0..free.len() {
            let (start, range_len) = free[i];
            if range_len >= len {
                if range_len == len {
                    free.remove(i);
                } else {
                    free[i] = (start + len, range_len - len);
                }
                return Some(start);
            }
        }
        None
    }

    /// Return `(start, len)` to the free list, merging adjacent ranges.
    fn release(&self, start: u64, len: u64) {
        let mut free = self.free.lock().unwrap();
        let pos = free.partition_point(|&(s, _)| s < start);
        free.insert(pos, (start, len));

        // Merge with the successor, then with the predecessor.
        if pos + 1 < free.len() && free[pos].0 + free[pos].1 == free[pos + 1].0 {
            free[pos].1 += free[pos + 1].1;
            free.remove(pos + 1);
        }
        if pos > 0 && free[pos - 1].0 + free[pos - 1].1 == free[pos].0 {
            free[pos - 1].1 += free[pos].1;
            free.remove(pos);
        }
    }
}

/// Host-backed DMA allocator over a fixed IOVA window.
#[derive(Clone)]
pub struct HostDmaAllocator {
    inner: Arc<WindowInner>,
}

impl HostDmaAllocator {
    /// Allocator over the default IOVA window.
    pub fn new() -> Self {
        Self::with_window(DMA_WINDOW_BASE, DMA_WINDOW_SIZE)
    }

    /// Allocator over an explicit IOVA window.
    pub fn with_window(base: u64, size: u64) -> Self {
        Self {
            inner: Arc::new(WindowInner {
                base,
                size,
                free: Mutex::new(vec![(base, size)]),
            }),
        }
    }

    /// Bytes currently available in the window.
    pub fn free_bytes(&self) -> u64 {
        let free = self.inner.free.lock().unwrap();
        free.iter().map(|&(_, len)| len).sum()
    }
}

impl Default for HostDmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HostDmaAllocator {
    fn alloc(&self, size: usize) -> Result<DmaBuffer> {
        if size == 0 {
            return Err(LoaderError::InvalidArgument(
                "zero-length DMA allocation".into(),
            ));
        }
        let aligned = align_up(size);
        let iova = self.inner.carve(aligned as u64).ok_or_else(|| {
            LoaderError::ResourceExhausted(format!(
                "IOVA window {:#x}+{:#x} cannot fit {:#x} bytes",
                self.inner.base, self.inner.size, aligned
            ))
        })?;
        log::trace!("dma alloc: iova={:#x} len={:#x}", iova, aligned);
        Ok(DmaBuffer {
            iova,
            requested: size,
            data: vec![0; aligned],
            window: Some(Arc::clone(&self.inner)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_to_dma_align() {
        let alloc = HostDmaAllocator::new();
        let buf = alloc.alloc(1).unwrap();
        assert_eq!(buf.requested_size(), 1);
        assert_eq!(buf.aligned_size(), DMA_ALIGN);
        assert_eq!(buf.iova() % DMA_ALIGN as u64, 0);

        let buf = alloc.alloc(DMA_ALIGN + 1).unwrap();
        assert_eq!(buf.aligned_size(), 2 * DMA_ALIGN);
    }

    #[test]
    fn alloc_zero_is_rejected() {
        let alloc = HostDmaAllocator::new();
        assert!(matches!(
            alloc.alloc(0),
            Err(LoaderError::InvalidArgument(_))
        ));
    }

    #[test]
    fn window_exhaustion_and_reuse() {
        let alloc = HostDmaAllocator::with_window(0x1000, 2 * DMA_ALIGN as u64);
        let a = alloc.alloc(DMA_ALIGN).unwrap();
        let b = alloc.alloc(DMA_ALIGN).unwrap();
        assert!(matches!(
            alloc.alloc(1),
            Err(LoaderError::ResourceExhausted(_))
        ));

        // Dropping a buffer returns its range.
        let a_iova = a.iova();
        drop(a);
        let c = alloc.alloc(DMA_ALIGN).unwrap();
        assert_eq!(c.iova(), a_iova);
        drop(b);
        drop(c);
        assert_eq!(alloc.free_bytes(), 2 * DMA_ALIGN as u64);
    }

    #[test]
    fn release_merges_adjacent_ranges() {
        let alloc = HostDmaAllocator::with_window(0, 4 * DMA_ALIGN as u64);
        let a = alloc.alloc(DMA_ALIGN).unwrap();
        let b = alloc.alloc(DMA_ALIGN).unwrap();
        let c = alloc.alloc(DMA_ALIGN).unwrap();
        drop(a);
        drop(c);
        drop(b);
        // All ranges coalesced back into one window-sized allocation.
        let big = alloc.alloc(4 * DMA_ALIGN).unwrap();
        assert_eq!(big.iova(), 0);
    }

    #[test]
    fn write_bounds_are_checked() {
        let alloc = HostDmaAllocator::new();
        let mut buf = alloc.alloc(16).unwrap();
        buf.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&buf.bytes()[..4], &[1, 2, 3, 4]);
        assert!(buf.write(buf.aligned_size(), &[0]).is_err());
    }
}
