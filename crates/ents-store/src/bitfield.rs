//! Growable bit set keyed by component definition id.
//!
//! Every entity carries a `BitField` recording which definitions it has a
//! component for. Queries build their own fields (`!bf`) and match them
//! against the entity index with [`and`] / [`or`].
//!
//! A field may also be the match-all sentinel ([`BitField::all`]) which
//! satisfies every membership test without storing any bits.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

const WORD_BITS: u32 = u32::BITS;

/// A packed, growable set of small non-negative integers.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "BitFieldRepr", try_from = "BitFieldRepr")]
pub struct BitField {
    /// Bit `n` lives in `words[n / 32]` at position `n % 32`.
    /// Trailing zero words are always trimmed so equal sets compare equal.
    words: SmallVec<[u32; 4]>,
    /// Match-all sentinel.
    all: bool,
}

impl BitField {
    /// Create an empty field.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the match-all sentinel.
    #[must_use]
    pub fn all() -> Self {
        Self {
            words: SmallVec::new(),
            all: true,
        }
    }

    /// Create a field with the given bits set. Duplicates are ignored.
    pub fn from_values(values: impl IntoIterator<Item = u32>) -> Self {
        let mut bf = Self::new();
        for value in values {
            bf.set(value);
        }
        bf
    }

    /// Whether this field is the match-all sentinel.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        self.all
    }

    /// Set bit `n`, growing the field as needed.
    pub fn set(&mut self, n: u32) {
        let (word, mask) = Self::locate(n);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= mask;
    }

    /// Set or clear bit `n`.
    pub fn set_to(&mut self, n: u32, on: bool) {
        if on {
            self.set(n);
        } else {
            self.clear(n);
        }
    }

    /// Clear bit `n`. Clearing an unset bit is a no-op.
    pub fn clear(&mut self, n: u32) {
        let (word, mask) = Self::locate(n);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !mask;
        }
        self.trim();
    }

    /// Membership test. Always true for the sentinel.
    #[must_use]
    pub fn get(&self, n: u32) -> bool {
        if self.all {
            return true;
        }
        let (word, mask) = Self::locate(n);
        self.words.get(word).is_some_and(|w| w & mask != 0)
    }

    /// Number of explicitly set bits.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// True when no bit is set and this is not the sentinel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.all && self.words.is_empty()
    }

    /// Iterate set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, &word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| idx as u32 * WORD_BITS + bit)
        })
    }

    /// Set bits in ascending order.
    #[must_use]
    pub fn to_values(&self) -> Vec<u32> {
        self.iter().collect()
    }

    const fn locate(n: u32) -> (usize, u32) {
        ((n / WORD_BITS) as usize, 1 << (n % WORD_BITS))
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

/// True iff the two fields share at least one bit, or either is the
/// match-all sentinel.
#[must_use]
pub fn and(a: &BitField, b: &BitField) -> bool {
    if a.all || b.all {
        return true;
    }
    a.words.iter().zip(b.words.iter()).any(|(x, y)| x & y != 0)
}

/// True iff the union of the two fields is non-empty.
#[must_use]
pub fn or(a: &BitField, b: &BitField) -> bool {
    !a.is_empty() || !b.is_empty()
}

impl FromIterator<u32> for BitField {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self::from_values(iter)
    }
}

impl fmt::Debug for BitField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all {
            return write!(f, "BitField(all)");
        }
        write!(f, "BitField({:?})", self.to_values())
    }
}

/// Little-endian bit string, bit 0 leftmost, up to the highest set bit.
impl fmt::Display for BitField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all {
            return write!(f, "all");
        }
        let Some(highest) = self.iter().last() else {
            return Ok(());
        };
        for n in 0..=highest {
            write!(f, "{}", if self.get(n) { '1' } else { '0' })?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum BitFieldRepr {
    Sentinel(String),
    Values(Vec<u32>),
}

impl From<BitField> for BitFieldRepr {
    fn from(bf: BitField) -> Self {
        if bf.all {
            Self::Sentinel("all".to_string())
        } else {
            Self::Values(bf.to_values())
        }
    }
}

impl TryFrom<BitFieldRepr> for BitField {
    type Error = String;

    fn try_from(repr: BitFieldRepr) -> Result<Self, Self::Error> {
        match repr {
            BitFieldRepr::Sentinel(s) if s == "all" => Ok(Self::all()),
            BitFieldRepr::Sentinel(s) => Err(format!("unknown bitfield sentinel {s:?}")),
            BitFieldRepr::Values(values) => Ok(Self::from_values(values)),
        }
    }
}
