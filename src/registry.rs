//! The executable registry: one per device context.
//!
//! Locking discipline:
//! - A single structural `Mutex` serializes slot allocation, load, unload
//!   and user-registration changes.
//! - `task_refs` are per-slot atomics mutated without the structural mutex,
//!   so job-submission and job-completion paths never contend with the
//!   slower load/unload paths.
//! - `registered` is an atomic mirror of the registered subset of the
//!   occupancy mask; `is_registered` is a single Acquire load.
//! - Resolve and descriptor queries clone the image's `Arc` under a short
//!   critical section and read outside the lock. The image payload is
//!   immutable once registered; the caller's task reference keeps the
//!   buffers mapped for as long as the returned addresses are used.
//!
//! The acquire/unload race is closed by protocol: `acquire_task_ref`
//! increments its counter first and then re-checks the registered mask,
//! backing off on failure; `unload` clears the mask bit before it reads the
//! counter. Either the acquire lands before the unload's counter read (the
//! unload sees it and reports busy) or it observes the cleared bit and
//! backs off. The two sides form a store-buffering pattern (write A, read
//! B vs. write B, read A), which acquire/release alone does not order, so
//! these four operations are `SeqCst`: without a single total order both
//! threads could read the pre-write values, letting an acquire succeed on
//! an image the unload is simultaneously freeing.

use crate::dma::DmaAllocator;
use crate::error::{LoaderError, Result};
use crate::image::LoadedImage;
use crate::slots::{MAX_EXECUTABLES, SlotAllocator};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Structural state, guarded by the registry mutex.
struct RegistryState {
    slots: SlotAllocator,
    images: Vec<Option<Arc<LoadedImage>>>,
}

/// Registry of loaded VPU executables for one device context.
pub struct ExeRegistry {
    allocator: Arc<dyn DmaAllocator>,
    state: Mutex<RegistryState>,
    /// Bit `i` set ⇔ slot `i` holds a fully registered image. Lock-free
    /// mirror for hot-path queries and the acquire/unload protocol.
    registered: AtomicU32,
    /// In-flight task references per slot.
    task_refs: Box<[AtomicU32]>,
}

impl ExeRegistry {
    /// Registry with the full `MAX_EXECUTABLES` slot table.
    pub fn new(allocator: Arc<dyn DmaAllocator>) -> Self {
        Self::build(MAX_EXECUTABLES, allocator)
    }

    /// Registry with a reduced slot table. Fails with `InvalidArgument`
    /// unless `capacity` is in `1..=MAX_EXECUTABLES`.
    pub fn with_capacity(capacity: usize, allocator: Arc<dyn DmaAllocator>) -> Result<Self> {
        if capacity < 1 || capacity > MAX_EXECUTABLES {
            return Err(LoaderError::InvalidArgument(format!(
                "registry capacity must be in 1..={MAX_EXECUTABLES}, got {capacity}"
            )));
        }
        Ok(Self::build(capacity, allocator))
    }

    fn build(capacity: usize, allocator: Arc<dyn DmaAllocator>) -> Self {
        let task_refs: Vec<AtomicU32> = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        Self {
            allocator,
            state: Mutex::new(RegistryState {
                slots: SlotAllocator::new(capacity),
                images: (0..capacity).map(|_| None).collect(),
            }),
            registered: AtomicU32::new(0),
            task_refs: task_refs.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.task_refs.len()
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> u32 {
        self.lock_state().slots.occupied()
    }

    #[inline]
    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap()
    }

    #[inline]
    fn slot_bit(id: u16) -> u32 {
        1 << id
    }

    /// Load an executable image and register it.
    ///
    /// Either the image becomes fully usable or the call leaves no residue:
    /// a failure after slot reservation frees the reserved slot, and staged
    /// DMA buffers are released by drop.
    pub fn load(&self, bytes: &[u8]) -> Result<u16> {
        if bytes.is_empty() {
            return Err(LoaderError::InvalidArgument(
                "empty executable buffer".into(),
            ));
        }

        // Reserve a slot, then parse and stage outside the lock. The
        // reservation keeps the id from being handed out twice.
        let id = self.lock_state().slots.allocate()?;

        let image = match LoadedImage::from_elf(id, bytes, &*self.allocator) {
            Ok(image) => image,
            Err(e) => {
                // Roll the reservation back; the slot was untouched apart
                // from its occupancy bit.
                let mut state = self.lock_state();
                let _ = state.slots.free(id);
                return Err(e);
            }
        };

        let mut state = self.lock_state();
        state.images[id as usize] = Some(Arc::new(image));
        let prev = self
            .registered
            .fetch_or(Self::slot_bit(id), Ordering::Release);
        if prev & Self::slot_bit(id) != 0 {
            // The slot was reserved for us; a set bit here means the mask
            // and the slot table have diverged.
            log::error!("registered mask already set for freshly loaded exe {id}");
            return Err(LoaderError::InvalidState(format!(
                "slot {id} registered before load completed"
            )));
        }
        log::debug!(
            "exe {} registered ({} of {} slots occupied)",
            id,
            state.slots.occupied(),
            state.slots.capacity()
        );
        Ok(id)
    }

    /// Tear down one executable and return its slot.
    ///
    /// Fails with `ResourceBusy` while task references are outstanding; the
    /// caller must retry once the referencing tasks have completed.
    pub fn unload(&self, id: u16) -> Result<()> {
        let mut state = self.lock_state();
        if !state.slots.is_set(id) {
            return Err(LoaderError::InvalidArgument(format!(
                "executable {id} is not loaded"
            )));
        }

        // Unpublish first so no new task reference can land, then check the
        // counter. SeqCst on both: see the module docs for the race
        // protocol and why weaker orderings do not close it.
        let bit = Self::slot_bit(id);
        let was_registered = self.registered.fetch_and(!bit, Ordering::SeqCst) & bit != 0;
        let refs = self.task_refs[id as usize].load(Ordering::SeqCst);
        if refs > 0 {
            if was_registered {
                self.registered.fetch_or(bit, Ordering::Release);
            }
            return Err(LoaderError::ResourceBusy { id, refs });
        }

        state.images[id as usize] = None;
        state.slots.free(id)?;
        log::info!("unloaded executable {id}");
        Ok(())
    }

    /// Best-effort teardown of every loaded executable, regardless of
    /// outstanding task references.
    ///
    /// Caller contract: no concurrent task activity. This is the shutdown
    /// sweep for the device context; references still outstanding are
    /// logged and discarded.
    pub fn unload_all(&self) {
        let mut state = self.lock_state();
        let occupied: Vec<u16> = state.slots.iter_occupied().collect();
        for id in occupied {
            let refs = self.task_refs[id as usize].swap(0, Ordering::AcqRel);
            if refs > 0 {
                log::warn!(
                    "unload_all: executable {id} still has {refs} task reference(s)"
                );
            }
            self.registered
                .fetch_and(!Self::slot_bit(id), Ordering::AcqRel);
            state.images[id as usize] = None;
            let _ = state.slots.free(id);
        }
    }

    /// Lock-free point query: does slot `id` hold a registered image?
    #[inline]
    pub fn is_registered(&self, id: u16) -> bool {
        (id as usize) < self.capacity()
            && self.registered.load(Ordering::Acquire) & Self::slot_bit(id) != 0
    }

    /// Pin an executable for the duration of one accelerator job.
    ///
    /// Must be called before a job referencing the image's buffers is
    /// enqueued. Lock-free.
    pub fn acquire_task_ref(&self, id: u16) -> Result<()> {
        if id as usize >= self.capacity() {
            return Err(LoaderError::NotFound(format!(
                "executable id {id} out of range"
            )));
        }
        // Increment-then-recheck, SeqCst on both sides of the protocol (see
        // the module docs); the pin must be visible before the mask is read.
        self.task_refs[id as usize].fetch_add(1, Ordering::SeqCst);
        if self.registered.load(Ordering::SeqCst) & Self::slot_bit(id) == 0 {
            self.task_refs[id as usize].fetch_sub(1, Ordering::AcqRel);
            return Err(LoaderError::NotFound(format!(
                "executable {id} is not registered"
            )));
        }
        Ok(())
    }

    /// Drop a task pin. Lock-free; called from the job-completion path.
    pub fn release_task_ref(&self, id: u16) -> Result<()> {
        if id as usize >= self.capacity() {
            return Err(LoaderError::InvalidArgument(format!(
                "executable id {id} out of range"
            )));
        }
        let result = self.task_refs[id as usize].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |refs| refs.checked_sub(1),
        );
        if result.is_err() {
            // Underflow means a counted resource has gone inconsistent.
            log::error!("task reference underflow on executable {id}");
            return Err(LoaderError::InvalidState(format!(
                "task reference underflow on executable {id}"
            )));
        }
        Ok(())
    }

    /// Remove the executable from the naming namespace without freeing its
    /// buffers. New task references are rejected afterwards; existing ones
    /// drain normally and teardown happens on a later `unload`.
    pub fn release_user_reg(&self, id: u16) -> Result<()> {
        let state = self.lock_state();
        if !state.slots.is_set(id) || !self.is_registered(id) {
            return Err(LoaderError::NotFound(format!(
                "executable {id} is not registered"
            )));
        }
        self.registered
            .fetch_and(!Self::slot_bit(id), Ordering::AcqRel);
        log::debug!("user registration released for executable {id}");
        Ok(())
    }

    /// Re-register a still-loaded executable whose user registration was
    /// released. Fails with `AlreadyExists` if the slot is registered.
    pub fn acquire_user_reg(&self, id: u16) -> Result<()> {
        let state = self.lock_state();
        if !state.slots.is_set(id) || state.images[id as usize].is_none() {
            return Err(LoaderError::NotFound(format!(
                "executable {id} is not loaded"
            )));
        }
        let prev = self
            .registered
            .fetch_or(Self::slot_bit(id), Ordering::AcqRel);
        if prev & Self::slot_bit(id) != 0 {
            return Err(LoaderError::AlreadyExists(id));
        }
        Ok(())
    }

    /// Clone the published image for `id`, requiring it to be registered.
    fn registered_image(&self, id: u16) -> Result<Arc<LoadedImage>> {
        if !self.is_registered(id) {
            return Err(LoaderError::NotFound(format!(
                "executable {id} is not registered"
            )));
        }
        let state = self.lock_state();
        state.images[id as usize].clone().ok_or_else(|| {
            log::error!("registered mask set but slot {id} holds no image");
            LoaderError::InvalidState(format!("slot {id} registered but empty"))
        })
    }

    /// Resolve a symbol by name to its dense id and size.
    pub fn resolve_by_name(&self, id: u16, name: &str) -> Result<(u16, u32)> {
        let image = self.registered_image(id)?;
        let sym = image.find_symbol(name).ok_or_else(|| {
            LoaderError::NotFound(format!("symbol \"{name}\" not found in executable {id}"))
        })?;
        Ok((sym.symbol_id, sym.size))
    }

    /// Resolve a symbol id to its VMEM address.
    pub fn resolve_offset(&self, id: u16, symbol_id: u16) -> Result<u32> {
        let image = self.registered_image(id)?;
        let sym = image.symbol_by_id(symbol_id).ok_or_else(|| {
            LoaderError::NotFound(format!(
                "symbol id {symbol_id} out of range for executable {id}"
            ))
        })?;
        Ok(sym.vmem_addr)
    }

    /// IOVA of the firmware descriptor for `id`, handed to the accelerator's
    /// command path. The caller must hold a task reference for as long as
    /// firmware may dereference it.
    pub fn bin_info_iova(&self, id: u16) -> Result<u64> {
        Ok(self.registered_image(id)?.bin_info_iova())
    }
}

impl Drop for ExeRegistry {
    fn drop(&mut self) {
        self.unload_all();
    }
}
