//! Word and code-address vocabulary.
//!
//! Stacks and stack chunks are arrays of machine words indexed by word
//! offsets that grow downward (a callee lives at a lower index than its
//! caller). Code addresses live in a separate space owned by the code
//! cache. Keeping the two apart with a `Pc` newtype catches the classic
//! stack-walker bug of mixing a return-address slot with a stack slot.

/// One machine word. Stack slots, chunk slots and frame metadata are all
/// stored as raw words; interpretation depends on the slot.
pub type Word = usize;

/// A code-space address.
///
/// `Pc(0)` is the null pc: no blob ever occupies address zero, so a zero
/// word in a return-pc slot always means "no continuation point".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pc(pub usize);

impl Pc {
    /// The null code address.
    pub const NULL: Pc = Pc(0);

    /// Whether this is the null pc.
    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw word representation, as stored in a return-pc slot.
    #[inline(always)]
    pub const fn to_word(self) -> Word {
        self.0
    }

    /// Reconstruct a pc from a stack or chunk slot.
    #[inline(always)]
    pub const fn from_word(word: Word) -> Pc {
        Pc(word)
    }

    /// Offset this pc forward by `words` code positions.
    #[inline(always)]
    pub const fn offset(self, words: usize) -> Pc {
        Pc(self.0 + words)
    }
}

impl std::fmt::Debug for Pc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "Pc(null)")
        } else {
            write!(f, "Pc({:#x})", self.0)
        }
    }
}
