//! Mutation dictionaries mined from the tables of recent compares.
//!
//! A dictionary entry is a hint for the mutator: a value the target compared
//! something against, plus optionally the position in the current input
//! where the comparison's other side was found.

use crate::torc::{match_buffer_pair, CmpOperand, TableOfRecentCompares, TablesOfRecentCompares};
use rand::Rng;

/// A mutation hint: a value to splice into the input, optionally at a known
/// position. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DictionaryEntry<T> {
    /// Element index in the input at which the matched counterpart was
    /// found; `None` when the hint is positionless.
    pub position_hint: Option<usize>,
    /// The bytes (as elements of the input's type) to splice.
    pub value: Vec<T>,
}

/// A dictionary of scalar values for mutating integers of width
/// `size_of::<T>()`.
#[derive(Debug, Default)]
pub struct IntegerDictionary<T: CmpOperand> {
    entries: Vec<T>,
}

impl<T: CmpOperand> IntegerDictionary<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Replaces the dictionary with every TORC value compared against `val`
    /// within `[min, max]`.
    pub fn match_from_torc(&mut self, val: T, torc: &TablesOfRecentCompares, min: T, max: T) {
        self.entries = torc.integers::<T>().matching_values(val, min, max);
    }

    pub fn add_entry(&mut self, val: T) {
        self.entries.push(val);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// A uniformly chosen saved entry. Panics on an empty dictionary.
    pub fn random_saved_entry(&self, rng: &mut impl Rng) -> T {
        assert!(!self.entries.is_empty(), "dictionary has no saved entries");
        self.entries[rng.random_range(0..self.entries.len())]
    }

    /// Draws a hint straight from the TORC without populating the
    /// dictionary: picks a random slot, prefers its match against `val`, and
    /// falls back to a random side of that slot. Either way the result is
    /// clamped to `[min, max]`.
    pub fn random_torc_entry(
        val: T,
        rng: &mut impl Rng,
        torc: &TablesOfRecentCompares,
        min: T,
        max: T,
    ) -> Option<T> {
        let table = torc.integers::<T>();
        let idx = rng.random_range(0..TableOfRecentCompares::<T>::TABLE_SIZE);
        table
            .matching_value_at(val, idx, min, max)
            .or_else(|| table.random_side(rng, idx, min, max))
    }
}

/// A dictionary of byte-sequence values for mutating containers with element
/// type `T` (widths 1, 2, 4 or 8).
#[derive(Debug, Default)]
pub struct ContainerDictionary<T: CmpOperand> {
    entries: Vec<DictionaryEntry<T>>,
}

impl<T: CmpOperand> ContainerDictionary<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Replaces the dictionary with every hint the TORCs yield for `val`:
    /// all buffer-table matches, plus the 4- and 8-byte integer tables
    /// re-interpreted as little-endian byte needles.
    pub fn match_from_torc(&mut self, val: &[T], torc: &TablesOfRecentCompares) {
        self.entries = torc.buffers().matching_entries(val);
        self.add_matching_integer_entries(val, torc);
    }

    /// Scans the wide integer tables for operands occurring inside `val`.
    ///
    /// For elements up to 4 bytes wide, each 8-byte operand pair is also
    /// truncated to 32 bits and searched again: targets often compare values
    /// after implicit integer promotion, and the promoted compare would
    /// otherwise never match the unpromoted bytes in the input.
    fn add_matching_integer_entries(&mut self, val: &[T], torc: &TablesOfRecentCompares) {
        if T::WIDTH <= 4 && val.len() >= 4 {
            for entry in torc.integers::<u32>().entries() {
                if let Some(matched) = match_integer_pair(val, entry.lhs, entry.rhs) {
                    self.entries.push(matched);
                }
            }
            for entry in torc.integers::<u64>().entries() {
                if let Some(matched) =
                    match_integer_pair(val, entry.lhs as u32, entry.rhs as u32)
                {
                    self.entries.push(matched);
                }
            }
        }
        if val.len() >= 8 {
            for entry in torc.integers::<u64>().entries() {
                if let Some(matched) = match_integer_pair(val, entry.lhs, entry.rhs) {
                    self.entries.push(matched);
                }
            }
        }
    }

    pub fn add_entry(&mut self, entry: DictionaryEntry<T>) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// A uniformly chosen saved entry. Panics on an empty dictionary.
    pub fn random_saved_entry(&self, rng: &mut impl Rng) -> &DictionaryEntry<T> {
        assert!(!self.entries.is_empty(), "dictionary has no saved entries");
        &self.entries[rng.random_range(0..self.entries.len())]
    }

    /// Draws one hint straight from the TORCs without populating the
    /// dictionary.
    ///
    /// With probability 1/2 a random buffer-table slot is used (preferring
    /// its match against `val`, falling back to a random side); otherwise a
    /// wide integer table is used, uniformly among the variants legal for
    /// the element width, including the truncate-to-32-bits pass.
    pub fn random_torc_entry(
        val: &[T],
        rng: &mut impl Rng,
        torc: &TablesOfRecentCompares,
    ) -> Option<DictionaryEntry<T>> {
        if rng.random_bool(0.5) {
            let entry = torc.buffers().random_entry(rng);
            entry
                .matching_entry(val)
                .or_else(|| entry.random_side(rng))
        } else if T::WIDTH <= 4 {
            match rng.random_range(0..3) {
                0 => {
                    let entry = torc.integers::<u32>().random_entry(rng);
                    match_integer_pair(val, entry.lhs, entry.rhs)
                }
                1 => {
                    let entry = torc.integers::<u64>().random_entry(rng);
                    match_integer_pair(val, entry.lhs as u32, entry.rhs as u32)
                }
                _ => {
                    let entry = torc.integers::<u64>().random_entry(rng);
                    match_integer_pair(val, entry.lhs, entry.rhs)
                }
            }
        } else {
            let entry = torc.integers::<u64>().random_entry(rng);
            match_integer_pair(val, entry.lhs, entry.rhs)
        }
    }
}

/// Serializes an integer operand pair to little-endian bytes and searches it
/// inside `val` like a buffer-table entry.
fn match_integer_pair<T: CmpOperand, V: CmpOperand>(
    val: &[T],
    lhs: V,
    rhs: V,
) -> Option<DictionaryEntry<T>> {
    let mut bytes1 = Vec::with_capacity(V::WIDTH);
    lhs.write_le(&mut bytes1);
    let mut bytes2 = Vec::with_capacity(V::WIDTH);
    rhs.write_le(&mut bytes2);
    match_buffer_pair(val, &bytes1, &bytes2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn integer_dictionary_populates_from_matches() {
        let mut torc = TablesOfRecentCompares::new();
        torc.integers_mut::<u32>().insert(42, 99);
        torc.integers_mut::<u32>().insert(1000, 42);

        let mut dictionary = IntegerDictionary::<u32>::new();
        dictionary.match_from_torc(42, &torc, u32::MIN, u32::MAX);
        assert_eq!(dictionary.len(), 2);

        dictionary.match_from_torc(42, &torc, 0, 100);
        assert_eq!(dictionary.len(), 1, "1000 falls outside [0, 100]");

        dictionary.add_entry(7);
        assert_eq!(dictionary.len(), 2);
        assert!(!dictionary.is_empty());
    }

    #[test]
    fn integer_dictionary_random_saved_entry_draws_from_saved() {
        let mut dictionary = IntegerDictionary::<u16>::new();
        dictionary.add_entry(11);
        dictionary.add_entry(22);
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        for _ in 0..32 {
            let entry = dictionary.random_saved_entry(&mut rng);
            assert!(entry == 11 || entry == 22);
        }
    }

    #[test]
    fn integer_dictionary_random_torc_entry_prefers_the_match() {
        let mut torc = TablesOfRecentCompares::new();
        // Fill every slot with the same pair so any random slot matches.
        for _ in 0..TableOfRecentCompares::<u64>::TABLE_SIZE * 2 {
            torc.integers_mut::<u64>().insert(5, 1_000_000);
        }
        let mut rng = ChaCha8Rng::from_seed([4; 32]);
        for _ in 0..16 {
            let drawn =
                IntegerDictionary::<u64>::random_torc_entry(5, &mut rng, &torc, u64::MIN, u64::MAX);
            assert_eq!(drawn, Some(1_000_000));
        }
    }

    #[test]
    fn integer_dictionary_random_torc_entry_falls_back_to_a_side() {
        let mut torc = TablesOfRecentCompares::new();
        for _ in 0..TableOfRecentCompares::<u8>::TABLE_SIZE * 2 {
            torc.integers_mut::<u8>().insert(10, 20);
        }
        let mut rng = ChaCha8Rng::from_seed([5; 32]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            // 77 matches nothing, so the fallback draws a random side.
            if let Some(side) =
                IntegerDictionary::<u8>::random_torc_entry(77, &mut rng, &torc, u8::MIN, u8::MAX)
            {
                seen.insert(side);
            }
        }
        assert_eq!(seen, [10u8, 20].into_iter().collect());
    }

    #[test]
    fn container_dictionary_matches_buffers_with_position_hints() {
        let mut torc = TablesOfRecentCompares::new();
        torc.buffers_mut().insert(b"PASSWORD", b"hunter2=");

        let val: Vec<u8> = b"XPASSWORD!".to_vec();
        let mut dictionary = ContainerDictionary::<u8>::new();
        dictionary.match_from_torc(&val, &torc);
        assert!(dictionary.entries.contains(&DictionaryEntry {
            position_hint: Some(1),
            value: b"hunter2=".to_vec(),
        }));
    }

    #[test]
    fn container_dictionary_mines_wide_integer_tables() {
        let mut torc = TablesOfRecentCompares::new();
        torc.integers_mut::<u32>().insert(0x44434241, 0x99999999); // "ABCD" LE
        let val: Vec<u8> = b"xxABCDxx".to_vec();

        let mut dictionary = ContainerDictionary::<u8>::new();
        dictionary.match_from_torc(&val, &torc);
        assert!(
            dictionary.entries.contains(&DictionaryEntry {
                position_hint: Some(2),
                value: 0x99999999u32.to_le_bytes().to_vec(),
            }),
            "the 4-byte operand found in the input must hint its counterpart"
        );
    }

    #[test]
    fn container_dictionary_applies_the_promotion_truncation_pass() {
        let mut torc = TablesOfRecentCompares::new();
        // A 64-bit compare whose low 32 bits are "WXYZ"; the full 8 bytes do
        // not occur in the input, the truncated 4 bytes do.
        torc.integers_mut::<u64>()
            .insert(0xFFFF_FFFF_5A59_5857, 0x1111_1111_0000_002A);
        let val: Vec<u8> = b"..WXYZ..".to_vec();

        let mut dictionary = ContainerDictionary::<u8>::new();
        dictionary.match_from_torc(&val, &torc);
        assert!(
            dictionary.entries.contains(&DictionaryEntry {
                position_hint: Some(2),
                value: 0x2Au32.to_le_bytes().to_vec(),
            }),
            "the 64-bit operand must also be searched truncated to 32 bits"
        );
    }

    #[test]
    fn container_dictionary_skips_integer_pass_for_short_inputs() {
        let mut torc = TablesOfRecentCompares::new();
        torc.integers_mut::<u32>().insert(0x00434241, 0x55555555);
        let val: Vec<u8> = b"ABC".to_vec(); // 3 elements, below the 4-element floor

        let mut dictionary = ContainerDictionary::<u8>::new();
        dictionary.match_from_torc(&val, &torc);
        assert!(dictionary.is_empty());
    }

    #[test]
    fn container_dictionary_random_torc_entry_draws_from_both_sources() {
        let mut torc = TablesOfRecentCompares::new();
        // The (37, 89) cursor has full period on power-of-two tables, so
        // inserting 2x the table size fills every slot.
        for _ in 0..256 {
            torc.buffers_mut().insert(b"needle!!", b"other!!!");
        }
        for _ in 0..TableOfRecentCompares::<u32>::TABLE_SIZE * 2 {
            torc.integers_mut::<u32>().insert(0x64636261, 0x30313233); // "abcd" / "3210"
        }
        for _ in 0..TableOfRecentCompares::<u64>::TABLE_SIZE * 2 {
            torc.integers_mut::<u64>()
                .insert(0x6867666564636261, 0x3031323334353637);
        }

        let val: Vec<u8> = b"..abcdefgh..".to_vec();
        let mut rng = ChaCha8Rng::from_seed([6; 32]);
        let mut integer_hints = 0;
        let mut buffer_draws = 0;
        for _ in 0..256 {
            match ContainerDictionary::<u8>::random_torc_entry(&val, &mut rng, &torc) {
                Some(entry) if entry.position_hint.is_some() => integer_hints += 1,
                Some(_) => buffer_draws += 1,
                None => {}
            }
        }
        assert!(integer_hints > 0, "integer tables must contribute hints");
        assert!(
            buffer_draws > 0,
            "buffer side draws (no hint) must also occur"
        );
    }
}
