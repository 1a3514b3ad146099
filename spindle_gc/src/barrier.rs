//! Store-barrier sets.
//!
//! A barrier set is the hook the continuation core invokes after writing
//! reference words into memory the collector tracks. Freeze applies it
//! over a freshly written chunk region when the chunk lives in barriered
//! memory; thaw applies it per frame when the chunk has been seen by a
//! collection.
//!
//! Two sets are provided: [`NoBarriers`] for collectors that scan young
//! chunks wholesale, and [`CardTableBarriers`], which dirties a card per
//! holder object so a later remembered-set scan revisits it. The engines
//! are generic over the set, so the choice is monomorphized out of the
//! hot path.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Card state values.
pub const CARD_CLEAN: u8 = 0;
pub const CARD_DIRTY: u8 = 1;

/// Which barrier set a runtime was resolved with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BarrierKind {
    /// No store barriers.
    None = 0,
    /// Card-marking store barriers.
    CardTable = 1,
}

/// Store-barrier interface the freeze/thaw engines are generic over.
pub trait BarrierSet: Send + Sync + 'static {
    /// The kind tag, for entry-point resolution.
    fn kind(&self) -> BarrierKind;

    /// Record a reference store into `holder` (object address). Called
    /// once per stored reference word.
    fn store_ref(&self, holder: usize);

    /// Number of stores recorded, for verification.
    fn stores_recorded(&self) -> u64;
}

/// The empty barrier set.
pub struct NoBarriers;

impl BarrierSet for NoBarriers {
    #[inline(always)]
    fn kind(&self) -> BarrierKind {
        BarrierKind::None
    }

    #[inline(always)]
    fn store_ref(&self, _holder: usize) {}

    #[inline]
    fn stores_recorded(&self) -> u64 {
        0
    }
}

/// Card-marking barrier set.
///
/// Holder addresses hash onto a fixed card array; a dirty card means
/// some object on it took a reference store since the last scan. The
/// mapping is lossy by design: a spurious re-scan is benign, a missed
/// store is not, and hashing can only cause the former.
pub struct CardTableBarriers {
    cards: Box<[AtomicU8]>,
    card_shift: u32,
    stores: AtomicU64,
}

impl CardTableBarriers {
    /// Default card granule: 512 bytes of holder address space per card.
    pub const DEFAULT_CARD_SHIFT: u32 = 9;

    /// Create a table with `num_cards` cards (rounded up to a power of
    /// two) at the default granule.
    pub fn new(num_cards: usize) -> Self {
        let num_cards = num_cards.next_power_of_two();
        let cards: Vec<AtomicU8> = (0..num_cards).map(|_| AtomicU8::new(CARD_CLEAN)).collect();
        Self {
            cards: cards.into_boxed_slice(),
            card_shift: Self::DEFAULT_CARD_SHIFT,
            stores: AtomicU64::new(0),
        }
    }

    #[inline]
    fn card_index(&self, holder: usize) -> usize {
        (holder >> self.card_shift) & (self.cards.len() - 1)
    }

    /// Whether the card covering `holder` is dirty.
    #[inline]
    pub fn is_dirty(&self, holder: usize) -> bool {
        self.cards[self.card_index(holder)].load(Ordering::Relaxed) == CARD_DIRTY
    }

    /// Clear every card.
    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Count dirty cards.
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == CARD_DIRTY)
            .count()
    }
}

impl BarrierSet for CardTableBarriers {
    #[inline(always)]
    fn kind(&self) -> BarrierKind {
        BarrierKind::CardTable
    }

    #[inline]
    fn store_ref(&self, holder: usize) {
        self.cards[self.card_index(holder)].store(CARD_DIRTY, Ordering::Relaxed);
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn stores_recorded(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_barriers_is_silent() {
        let set = NoBarriers;
        set.store_ref(0x1234);
        assert_eq!(set.kind(), BarrierKind::None);
        assert_eq!(set.stores_recorded(), 0);
    }

    #[test]
    fn test_card_marking() {
        let set = CardTableBarriers::new(64);
        let holder = 0x8000_1000usize;

        assert!(!set.is_dirty(holder));
        set.store_ref(holder);
        assert!(set.is_dirty(holder));
        assert_eq!(set.stores_recorded(), 1);

        set.clear_all();
        assert!(!set.is_dirty(holder));
        assert_eq!(set.dirty_count(), 0);
    }

    #[test]
    fn test_same_card_aliases() {
        let set = CardTableBarriers::new(64);
        let a = 0x9000_0000usize;
        let b = a + 100; // same 512-byte granule

        set.store_ref(a);
        assert!(set.is_dirty(b));
    }

    #[test]
    fn test_distinct_cards() {
        let set = CardTableBarriers::new(1024);
        let a = 0x9000_0000usize;
        let b = a + 4096;

        set.store_ref(a);
        assert!(!set.is_dirty(b));
        assert_eq!(set.dirty_count(), 1);
    }
}
