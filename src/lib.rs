//! Firmware executable registry and loader for a VPU-class accelerator.
//!
//! This crate sits between a device-management process and the
//! accelerator's firmware. It loads ELF executable images into DMA-visible
//! buffers, builds the firmware-consumable descriptor for each image,
//! resolves symbols for task-argument binding, and manages the two-class
//! reference lifetime that keeps buffers mapped while hardware may still
//! touch them:
//!
//! - a mutex-guarded *user registration* controls whether an executable is
//!   nameable by new callers;
//! - a lock-free *task reference* count pins an executable's buffers for
//!   the duration of each in-flight accelerator job.
//!
//! Typical flow: [`ExeRegistry::load`] assigns a slot id and builds the
//! image; [`ExeRegistry::resolve_by_name`] / [`ExeRegistry::resolve_offset`]
//! bind task arguments; [`ExeRegistry::acquire_task_ref`] pins the image
//! around each job; [`ExeRegistry::unload`] tears it down once the pins
//! have drained.

pub mod bin_info;
pub mod dma;
pub mod error;
pub mod image;
pub mod registry;
pub mod slots;
pub mod symbol;

#[cfg(test)]
pub(crate) mod testelf;

pub use dma::{DMA_ALIGN, DmaAllocator, DmaBuffer, HostDmaAllocator};
pub use error::{LoaderError, Result};
pub use image::{LoadedImage, MAX_SEGMENT_SIZE, Segment, SegmentKind};
pub use registry::ExeRegistry;
pub use slots::MAX_EXECUTABLES;
pub use symbol::{MAX_SYMBOL_NAME_LEN, MAX_SYMBOLS_PER_EXECUTABLE, Symbol};
