//! Chunk Allocator
//!
//! Every catalog object (guid entries, instance sets, data sources, MOF
//! resources and consumer objects) is carved out of a `ChunkPool`. A pool
//! owns a list of fixed-capacity chunks; each chunk keeps a free list of
//! slot indices and a count of slots in use.
//!
//! # Slot lifecycle
//!
//! ```text
//!   allocate ──► live (ref >= 1) ──unreference to 0──► INVALID
//!                  ▲      │                               │
//!               reference │                          take (value out)
//!                  └──────┘                               │
//!                                        release ◄────────┘
//!                                           │
//!                                      free list (chunk freed when
//!                                      empty, except the first chunk)
//! ```
//!
//! Reference counts and the slot flags word are atomics so that any
//! holder of a shared borrow may take or drop references. The transition
//! to zero is decided by a single atomic decrement, so exactly one caller
//! observes it and becomes responsible for unlinking and releasing the
//! slot. Unlinking and `release` need `&mut self` and therefore happen
//! under whatever lock protects the pool; the type-specific cleanup that
//! runs between `take` and `release` is done by the caller without it.

use crate::error::{Result, WmiError};
use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// Pool-level flags carried by every slot
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SlotFlags: u32 {
        /// Object is on its kind's in-use list
        const ON_INUSE_LIST = 0x4000_0000;
        /// Last reference dropped; slot awaits release
        const INVALID = 0x8000_0000;
    }
}

/// Stable handle to a pool slot
///
/// A handle names a chunk, a slot within it, and the slot generation it
/// was issued for. Handles outlive the object safely: lookups through a
/// stale handle simply fail.
pub struct Handle<T> {
    chunk: u32,
    slot: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(chunk: usize, slot: usize, generation: u32) -> Self {
        Self {
            chunk: chunk as u32,
            slot: slot as u32,
            generation,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.chunk == other.chunk && self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.chunk.hash(state);
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}:{}#{})", self.chunk, self.slot, self.generation)
    }
}

struct Slot<T> {
    signature: u32,
    flags: AtomicU32,
    ref_count: AtomicU32,
    generation: u32,
    value: Option<T>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            signature: 0,
            flags: AtomicU32::new(SlotFlags::INVALID.bits()),
            ref_count: AtomicU32::new(0),
            generation: 0,
            value: None,
        }
    }

    fn flags(&self) -> SlotFlags {
        SlotFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }
}

struct Chunk<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    in_use: usize,
}

impl<T> Chunk<T> {
    fn try_new(capacity: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| WmiError::InsufficientResources)?;
        let mut free = Vec::new();
        free.try_reserve_exact(capacity)
            .map_err(|_| WmiError::InsufficientResources)?;
        for i in 0..capacity {
            slots.push(Slot::empty());
            // Pop order hands out slot 0 first
            free.push((capacity - 1 - i) as u32);
        }
        Ok(Self {
            slots,
            free,
            in_use: 0,
        })
    }
}

/// Fixed-size slab allocator with per-slot reference counts
pub struct ChunkPool<T> {
    signature: u32,
    slots_per_chunk: usize,
    initial_flags: SlotFlags,
    chunks: Vec<Option<Chunk<T>>>,
}

impl<T> ChunkPool<T> {
    /// Create an empty pool. No memory is taken until the first allocation.
    pub const fn new(signature: u32, slots_per_chunk: usize, initial_flags: SlotFlags) -> Self {
        Self {
            signature,
            slots_per_chunk: if slots_per_chunk == 0 { 1 } else { slots_per_chunk },
            initial_flags,
            chunks: Vec::new(),
        }
    }

    pub fn signature(&self) -> u32 {
        self.signature
    }

    /// Allocate a slot holding `value` with a reference count of one
    pub fn allocate(&mut self, value: T) -> Result<Handle<T>> {
        let chunk_index = match self
            .chunks
            .iter()
            .position(|c| c.as_ref().is_some_and(|c| !c.free.is_empty()))
        {
            Some(index) => index,
            None => self.grow()?,
        };

        let chunk = self.chunks[chunk_index]
            .as_mut()
            .ok_or(WmiError::InsufficientResources)?;
        let slot_index = chunk.free.pop().ok_or(WmiError::InsufficientResources)? as usize;
        chunk.in_use += 1;

        let slot = &mut chunk.slots[slot_index];
        slot.signature = self.signature;
        slot.flags.store(self.initial_flags.bits(), Ordering::Release);
        slot.ref_count.store(1, Ordering::Release);
        slot.value = Some(value);

        Ok(Handle::new(chunk_index, slot_index, slot.generation))
    }

    fn grow(&mut self) -> Result<usize> {
        let chunk = Chunk::try_new(self.slots_per_chunk)?;
        if let Some(index) = self.chunks.iter().position(Option::is_none) {
            self.chunks[index] = Some(chunk);
            return Ok(index);
        }
        self.chunks
            .try_reserve(1)
            .map_err(|_| WmiError::InsufficientResources)?;
        self.chunks.push(Some(chunk));
        Ok(self.chunks.len() - 1)
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        let slot = self
            .chunks
            .get(handle.chunk as usize)?
            .as_ref()?
            .slots
            .get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        debug_assert_eq!(slot.signature, self.signature);
        Some(slot)
    }

    fn slot_mut(&mut self, handle: Handle<T>) -> Option<&mut Slot<T>> {
        let slot = self
            .chunks
            .get_mut(handle.chunk as usize)?
            .as_mut()?
            .slots
            .get_mut(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        Some(slot)
    }

    /// Take a reference unless the object is already being torn down
    pub fn reference(&self, handle: Handle<T>) -> bool {
        let Some(slot) = self.slot(handle) else {
            return false;
        };
        if slot.flags().contains(SlotFlags::INVALID) {
            return false;
        }
        slot.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    Some(count + 1)
                }
            })
            .is_ok()
    }

    /// Drop a reference.
    ///
    /// Returns `Ok(true)` to exactly one caller: the one whose decrement
    /// took the count to zero. The slot is marked `INVALID` before
    /// returning so no new references can be taken.
    pub fn unreference(&self, handle: Handle<T>) -> Result<bool> {
        let slot = self.slot(handle).ok_or(WmiError::InvalidHandle)?;
        let previous = slot
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map_err(|_| WmiError::InvalidHandle)?;
        if previous == 1 {
            slot.flags
                .fetch_or(SlotFlags::INVALID.bits(), Ordering::AcqRel);
            return Ok(true);
        }
        Ok(false)
    }

    /// Move the value out of a slot whose last reference is gone
    pub fn take(&mut self, handle: Handle<T>) -> Result<T> {
        let slot = self.slot_mut(handle).ok_or(WmiError::InvalidHandle)?;
        if *slot.ref_count.get_mut() != 0
            || !SlotFlags::from_bits_retain(*slot.flags.get_mut()).contains(SlotFlags::INVALID)
        {
            return Err(WmiError::InvalidParameter("slot still referenced"));
        }
        slot.value.take().ok_or(WmiError::InvalidHandle)
    }

    /// Return a slot to its chunk's free list.
    ///
    /// The slot must be unreferenced and marked `INVALID`. Returns true
    /// when the owning chunk became empty and its memory was given back.
    pub fn release(&mut self, handle: Handle<T>) -> Result<bool> {
        let chunk_index = handle.chunk as usize;
        let chunk = self
            .chunks
            .get_mut(chunk_index)
            .and_then(Option::as_mut)
            .ok_or(WmiError::InvalidHandle)?;
        let slot = chunk
            .slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .ok_or(WmiError::InvalidHandle)?;
        if *slot.ref_count.get_mut() != 0
            || !SlotFlags::from_bits_retain(*slot.flags.get_mut()).contains(SlotFlags::INVALID)
        {
            return Err(WmiError::InvalidParameter("slot still referenced"));
        }

        slot.value = None;
        slot.generation = slot.generation.wrapping_add(1);
        chunk.free.push(handle.slot);
        chunk.in_use -= 1;

        // The first chunk stays around as a cache
        if chunk.in_use == 0 && chunk_index != 0 {
            self.chunks[chunk_index] = None;
            return Ok(true);
        }
        Ok(false)
    }

    /// Live value behind a handle, including one that is being torn down
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slot(handle)?.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slot_mut(handle)?.value.as_mut()
    }

    /// True while the object holds references and is not being torn down
    pub fn is_live(&self, handle: Handle<T>) -> bool {
        self.slot(handle)
            .is_some_and(|s| s.value.is_some() && !s.flags().contains(SlotFlags::INVALID))
    }

    pub fn ref_count(&self, handle: Handle<T>) -> Option<u32> {
        self.slot(handle).map(|s| s.ref_count.load(Ordering::Acquire))
    }

    pub fn flags(&self, handle: Handle<T>) -> Option<SlotFlags> {
        self.slot(handle).map(Slot::flags)
    }

    pub fn set_flags(&self, handle: Handle<T>, flags: SlotFlags) {
        if let Some(slot) = self.slot(handle) {
            slot.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        }
    }

    pub fn clear_flags(&self, handle: Handle<T>, flags: SlotFlags) {
        if let Some(slot) = self.slot(handle) {
            slot.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
        }
    }

    /// Chunks currently backed by memory
    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.chunk_count() * self.slots_per_chunk
    }

    /// Slots handed out and not yet released
    pub fn live_count(&self) -> usize {
        self.chunks.iter().flatten().map(|c| c.in_use).sum()
    }

    /// Visit every slot that holds a value
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(ci, c)| c.as_ref().map(|c| (ci, c)))
            .flat_map(|(ci, c)| {
                c.slots.iter().enumerate().filter_map(move |(si, s)| {
                    s.value
                        .as_ref()
                        .map(|v| (Handle::new(ci, si, s.generation), v))
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    const SIG: u32 = u32::from_le_bytes(*b"Test");

    fn retire(pool: &mut ChunkPool<u32>, h: Handle<u32>) -> u32 {
        assert_eq!(pool.unreference(h), Ok(true));
        let value = pool.take(h).unwrap();
        pool.release(h).unwrap();
        value
    }

    #[test]
    fn test_allocate_initial_state() {
        let mut pool = ChunkPool::new(SIG, 4, SlotFlags::ON_INUSE_LIST);
        let h = pool.allocate(7u32).unwrap();
        assert_eq!(pool.ref_count(h), Some(1));
        assert_eq!(pool.flags(h), Some(SlotFlags::ON_INUSE_LIST));
        assert_eq!(pool.get(h), Some(&7));
        assert_eq!(pool.signature(), SIG);
        assert!(pool.is_live(h));

        pool.clear_flags(h, SlotFlags::ON_INUSE_LIST);
        assert_eq!(pool.flags(h), Some(SlotFlags::empty()));
        pool.set_flags(h, SlotFlags::ON_INUSE_LIST);
        assert_eq!(pool.flags(h), Some(SlotFlags::ON_INUSE_LIST));
    }

    #[test]
    fn test_release_requires_invalid_and_zero() {
        let mut pool = ChunkPool::new(SIG, 4, SlotFlags::empty());
        let h = pool.allocate(1u32).unwrap();
        assert!(pool.release(h).is_err());
        assert!(pool.take(h).is_err());

        assert!(pool.reference(h));
        assert_eq!(pool.unreference(h), Ok(false));
        assert_eq!(pool.unreference(h), Ok(true));
        assert!(pool.flags(h).unwrap().contains(SlotFlags::INVALID));
        assert!(!pool.reference(h));
        assert_eq!(pool.unreference(h), Err(WmiError::InvalidHandle));

        assert_eq!(pool.take(h), Ok(1));
        assert_eq!(pool.release(h), Ok(false));
        assert_eq!(pool.get(h), None);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_first_chunk_retained() {
        let mut pool = ChunkPool::new(SIG, 2, SlotFlags::empty());
        let handles: Vec<_> = (0..5).map(|i| pool.allocate(i).unwrap()).collect();
        assert_eq!(pool.chunk_count(), 3);

        for h in handles.iter().rev() {
            retire(&mut pool, *h);
        }
        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.live_count(), 0);

        // The cached chunk serves the next allocation
        pool.allocate(9).unwrap();
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut pool = ChunkPool::new(SIG, 2, SlotFlags::empty());
        let old = pool.allocate(1u32).unwrap();
        retire(&mut pool, old);
        let new = pool.allocate(2u32).unwrap();
        assert_ne!(old, new);
        assert_eq!(pool.get(old), None);
        assert!(!pool.reference(old));
        assert_eq!(pool.get(new), Some(&2));
    }

    #[test]
    fn test_live_slots_bounded_and_unique() {
        let mut pool = ChunkPool::new(SIG, 3, SlotFlags::empty());
        let mut live: Vec<Handle<u32>> = Vec::new();
        let mut seed = 0x1234_5678u32;

        for step in 0..2000u32 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            if seed % 3 != 0 || live.is_empty() {
                live.push(pool.allocate(step).unwrap());
            } else {
                let victim = live.swap_remove((seed as usize / 3) % live.len());
                retire(&mut pool, victim);
            }

            assert!(pool.live_count() <= pool.capacity());
            assert_eq!(pool.live_count(), live.len());
            let unique: HashSet<_> = live.iter().copied().collect();
            assert_eq!(unique.len(), live.len());
        }
    }

    #[test]
    fn test_iter_visits_live_values() {
        let mut pool = ChunkPool::new(SIG, 2, SlotFlags::empty());
        let a = pool.allocate(10u32).unwrap();
        let b = pool.allocate(20u32).unwrap();
        let c = pool.allocate(30u32).unwrap();
        retire(&mut pool, b);

        let seen: Vec<_> = pool.iter().collect();
        assert_eq!(seen, vec![(a, &10), (c, &30)]);
    }

    #[test]
    fn test_concurrent_unreference_single_cleanup() {
        const THREADS: usize = 8;

        for _ in 0..200 {
            let mut pool = ChunkPool::new(SIG, 4, SlotFlags::empty());
            let h = pool.allocate(42u32).unwrap();
            for _ in 1..THREADS {
                assert!(pool.reference(h));
            }

            let cleanups = AtomicUsize::new(0);
            std::thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(|| {
                        if pool.unreference(h).unwrap() {
                            cleanups.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
            });

            assert_eq!(cleanups.load(Ordering::SeqCst), 1);
            assert_eq!(pool.ref_count(h), Some(0));
            assert_eq!(pool.take(h), Ok(42));
            pool.release(h).unwrap();
        }
    }
}
