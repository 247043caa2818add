//! Generation-tagged double buffer shared by one writer thread and the
//! scheduler thread.
//!
//! The low bit of `generation` names the *user* side; the other side is the
//! *air* side. Only the scheduler flips roles, by bumping the generation and
//! then waiting out any write that started against the old user side. The
//! writer never waits: if the slot is busy the sample is dropped.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Spins before falling back to yielding while a write drains.
const SPIN_LIMIT: u32 = 64;

/// Period data held in either side of a [`MetricSlot`].
pub trait SlotData: Default + Send {
    /// True when the buffer received at least one write since its last reset.
    fn accessed(&self) -> bool;
}

/// One (node, index, filter) cell: user/air double buffer plus a lifetime
/// accumulator that only the reader touches.
pub struct MetricSlot<D, A = ()> {
    buffers: [UnsafeCell<D>; 2],
    acc: UnsafeCell<A>,
    generation: AtomicU64,
    writing: AtomicBool,
    reading: AtomicBool,
}

// SAFETY: the user side is only reached while `writing` is held, the air side
// and the accumulator only while `reading` is held, and `SlotReader::swap`
// waits for `writing` to clear before the old user side becomes readable.
unsafe impl<D: Send, A: Send> Sync for MetricSlot<D, A> {}

impl<D: Default, A: Default> Default for MetricSlot<D, A> {
    fn default() -> Self {
        Self {
            buffers: [UnsafeCell::new(D::default()), UnsafeCell::new(D::default())],
            acc: UnsafeCell::new(A::default()),
            generation: AtomicU64::new(0),
            writing: AtomicBool::new(false),
            reading: AtomicBool::new(false),
        }
    }
}

impl<D: SlotData, A: Default + Send> MetricSlot<D, A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `f` to the user side.
    ///
    /// Returns `None` without calling `f` when another write is in flight on
    /// this slot (re-entrant call or a concurrent quiescence probe).
    #[inline]
    pub fn write<R>(&self, f: impl FnOnce(&mut D) -> R) -> Option<R> {
        if self.writing.swap(true, Ordering::SeqCst) {
            return None;
        }
        let _release = FlagGuard(&self.writing);

        let side = (self.generation.load(Ordering::SeqCst) & 1) as usize;
        // SAFETY: `writing` is held, so no other writer is active, and the
        // reader never touches the user side named by the current generation.
        let data = unsafe { &mut *self.buffers[side].get() };
        Some(f(data))
    }

    /// Acquires the single reader handle, or `None` if one is already live.
    pub fn reader(&self) -> Option<SlotReader<'_, D, A>> {
        if self.reading.swap(true, Ordering::Acquire) {
            return None;
        }
        Some(SlotReader { slot: self })
    }

    /// Number of role flips so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Exclusive read access to the air side and the accumulator.
pub struct SlotReader<'a, D, A> {
    slot: &'a MetricSlot<D, A>,
}

impl<D: SlotData, A> SlotReader<'_, D, A> {
    #[inline]
    fn air_side(&self) -> usize {
        // Only the reader changes the generation.
        (1 - (self.slot.generation.load(Ordering::Relaxed) & 1)) as usize
    }

    /// Data of the period that was closed by the last swap.
    pub fn air(&mut self) -> &mut D {
        let side = self.air_side();
        // SAFETY: the reader owns the air side while `reading` is held.
        unsafe { &mut *self.slot.buffers[side].get() }
    }

    pub fn acc(&mut self) -> &mut A {
        // SAFETY: the accumulator is only reachable through the reader.
        unsafe { &mut *self.slot.acc.get() }
    }

    /// Air side and accumulator together.
    pub fn parts(&mut self) -> (&mut D, &mut A) {
        let side = self.air_side();
        // SAFETY: see `air` and `acc`; the two cells are disjoint.
        unsafe {
            (
                &mut *self.slot.buffers[side].get(),
                &mut *self.slot.acc.get(),
            )
        }
    }

    /// Takes the air side, leaving a reset buffer behind.
    pub fn take_air(&mut self) -> D {
        std::mem::take(self.air())
    }

    /// Flips user and air roles, then waits for a write that raced with the
    /// flip to finish on what is now the air side.
    pub fn swap(&mut self) {
        self.slot.generation.fetch_add(1, Ordering::SeqCst);
        let mut spins = 0u32;
        while self.slot.writing.load(Ordering::SeqCst) {
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// True when either side holds unconsumed writes.
    ///
    /// Briefly takes the write flag, so a write racing with this probe is
    /// dropped instead of blocking. A slot busy writing counts as pending.
    pub fn pending(&mut self) -> bool {
        if self.air().accessed() {
            return true;
        }
        if self.slot.writing.swap(true, Ordering::SeqCst) {
            return true;
        }
        let _release = FlagGuard(&self.slot.writing);
        let side = (self.slot.generation.load(Ordering::Relaxed) & 1) as usize;
        // SAFETY: the write flag is held, so the user side is not being written.
        unsafe { (*self.slot.buffers[side].get()).accessed() }
    }
}

impl<D, A> Drop for SlotReader<'_, D, A> {
    fn drop(&mut self) {
        self.slot.reading.store(false, Ordering::Release);
    }
}

/// Clears a flag on scope exit.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
