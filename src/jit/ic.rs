//! Inline-cache slots.
//!
//! Each specializable site in compiled code owns one heap-allocated slot;
//! the generated guard reaches it through an absolute address resolved at
//! patch time. Runtime transitions mutate whole aligned words through
//! atomics, and the guard reads them with plain aligned loads, so a racing
//! reader can lose a specialization but can never observe a torn unit.
//!
//! State machine per slot: uninitialized -> monomorphic on the first
//! observed shape/callee, monomorphic -> megamorphic on the second distinct
//! one. Megamorphic is terminal: the guard word is pinned to a sentinel
//! that matches nothing and the site dispatches generically forever.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::vm::shapes::{SHAPE_NONE, Sym};

pub const STATE_UNINIT: u32 = 0;
pub const STATE_MONO: u32 = 1;
pub const STATE_MEGA: u32 = 2;

/// Byte offsets read by generated code. Checked in tests.
pub mod layout {
    /// `PropertyCacheSlot::word`
    pub const PROP_WORD: i32 = 0;
    /// `CallCacheSlot::callee`
    pub const CALL_CALLEE: i32 = 0;
    /// `CallCacheSlot::hot_target`
    pub const CALL_HOT: i32 = 8;
    /// `CallCacheSlot::slow_target`
    pub const CALL_SLOW: i32 = 16;
}

/// Cache slot for a shape-guarded property access site.
///
/// The guard word packs the expected shape id in its low half and the slot
/// index in its high half, so guard and payload travel as one unit.
#[repr(C, align(64))]
pub struct PropertyCacheSlot {
    word: AtomicU64,
    state: AtomicU32,
    sym: Sym,
}

fn pack(shape: u32, slot: u32) -> u64 {
    (shape as u64) | ((slot as u64) << 32)
}

impl PropertyCacheSlot {
    pub fn new(sym: Sym) -> Self {
        PropertyCacheSlot {
            word: AtomicU64::new(pack(SHAPE_NONE, 0)),
            state: AtomicU32::new(STATE_UNINIT),
            sym,
        }
    }

    pub fn sym(&self) -> Sym {
        self.sym
    }

    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// The shape the guard currently accepts.
    pub fn cached_shape(&self) -> u32 {
        self.word.load(Ordering::Acquire) as u32
    }

    pub fn cached_slot(&self) -> u32 {
        (self.word.load(Ordering::Acquire) >> 32) as u32
    }

    /// Record a successful generic lookup of (shape, slot).
    pub fn note_hit(&self, shape: u32, slot: u32) {
        debug_assert_ne!(shape, SHAPE_NONE);
        match self.state.load(Ordering::Acquire) {
            STATE_UNINIT => {
                if self
                    .state
                    .compare_exchange(
                        STATE_UNINIT,
                        STATE_MONO,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.word.store(pack(shape, slot), Ordering::Release);
                    tracing::trace!(shape, slot, "property cache -> monomorphic");
                } else {
                    // Lost the race; treat as a fresh observation.
                    self.note_hit(shape, slot);
                }
            }
            STATE_MONO => {
                if self.cached_shape() != shape {
                    self.go_megamorphic();
                }
            }
            _ => {}
        }
    }

    /// One-way transition to the generic path.
    pub fn go_megamorphic(&self) {
        self.word.store(pack(SHAPE_NONE, 0), Ordering::Release);
        self.state.store(STATE_MEGA, Ordering::Release);
        tracing::trace!("property cache -> megamorphic");
    }
}

/// Cache slot for a call site.
///
/// The guard compares the callee value word; on a hit the site calls
/// through `hot_target`. Guard failures call through `slow_target`, which
/// walks the pre-link -> lazy-link -> generic trampoline progression.
#[repr(C, align(64))]
pub struct CallCacheSlot {
    callee: AtomicU64,
    hot_target: AtomicU64,
    slow_target: AtomicU64,
    state: AtomicU32,
}

impl CallCacheSlot {
    pub fn new() -> Self {
        CallCacheSlot {
            callee: AtomicU64::new(0),
            hot_target: AtomicU64::new(0),
            slow_target: AtomicU64::new(0),
            state: AtomicU32::new(STATE_UNINIT),
        }
    }

    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    pub fn cached_callee(&self) -> u64 {
        self.callee.load(Ordering::Acquire)
    }

    pub fn slow_target(&self) -> u64 {
        self.slow_target.load(Ordering::Acquire)
    }

    pub fn set_slow_target(&self, addr: u64) {
        self.slow_target.store(addr, Ordering::Release);
    }

    /// Bind the site to one callee. The hot target is published before the
    /// guard word so a concurrent fast path can never call through a stale
    /// target. Returns false when the site was no longer linkable.
    pub fn link_monomorphic(&self, callee: u64, entry: u64, generic_target: u64) -> bool {
        if self
            .state
            .compare_exchange(
                STATE_UNINIT,
                STATE_MONO,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.hot_target.store(entry, Ordering::Release);
        self.slow_target.store(generic_target, Ordering::Release);
        self.callee.store(callee, Ordering::Release);
        tracing::trace!(callee, entry, "call site linked monomorphic");
        true
    }

    /// One-way transition to generic dispatch: pin the guard closed. The
    /// hot target is left in place for threads mid-flight past the guard.
    pub fn go_megamorphic(&self) {
        self.callee.store(0, Ordering::Release);
        self.state.store(STATE_MEGA, Ordering::Release);
        tracing::trace!("call site -> megamorphic");
    }
}

impl Default for CallCacheSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_layout() {
        assert_eq!(offset_of!(PropertyCacheSlot, word), layout::PROP_WORD as usize);
        assert_eq!(offset_of!(CallCacheSlot, callee), layout::CALL_CALLEE as usize);
        assert_eq!(offset_of!(CallCacheSlot, hot_target), layout::CALL_HOT as usize);
        assert_eq!(offset_of!(CallCacheSlot, slow_target), layout::CALL_SLOW as usize);
        assert_eq!(std::mem::align_of::<PropertyCacheSlot>(), 64);
    }

    #[test]
    fn test_property_state_machine() {
        let ic = PropertyCacheSlot::new(3);
        assert_eq!(ic.state(), STATE_UNINIT);
        assert_eq!(ic.cached_shape(), SHAPE_NONE);

        ic.note_hit(7, 2);
        assert_eq!(ic.state(), STATE_MONO);
        assert_eq!(ic.cached_shape(), 7);
        assert_eq!(ic.cached_slot(), 2);

        // Same shape again: no transition, no re-patch.
        ic.note_hit(7, 2);
        assert_eq!(ic.state(), STATE_MONO);

        // Second distinct shape: megamorphic, guard pinned.
        ic.note_hit(9, 0);
        assert_eq!(ic.state(), STATE_MEGA);
        assert_eq!(ic.cached_shape(), SHAPE_NONE);

        // One-way: the original shape does not re-specialize the site.
        ic.note_hit(7, 2);
        assert_eq!(ic.state(), STATE_MEGA);
        assert_eq!(ic.cached_shape(), SHAPE_NONE);
    }

    #[test]
    fn test_call_state_machine() {
        let ic = CallCacheSlot::new();
        ic.set_slow_target(0x100);
        assert!(ic.link_monomorphic(0xA0, 0x2000, 0x300));
        assert_eq!(ic.state(), STATE_MONO);
        assert_eq!(ic.cached_callee(), 0xA0);
        assert_eq!(ic.slow_target(), 0x300);

        // Linking again fails; the first specialization stands.
        assert!(!ic.link_monomorphic(0xB0, 0x3000, 0x300));
        assert_eq!(ic.cached_callee(), 0xA0);

        ic.go_megamorphic();
        assert_eq!(ic.state(), STATE_MEGA);
        assert_eq!(ic.cached_callee(), 0);
        assert!(!ic.link_monomorphic(0xA0, 0x2000, 0x300));
    }
}
