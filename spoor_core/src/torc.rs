//! Tables of recent compares (TORC).
//!
//! Small, lossy tables holding the operands of recently executed integer and
//! buffer comparisons inside the target. Inserts land at a pseudo-random
//! rotating cursor without collision handling; entries may additionally be
//! torn by concurrent writers. Both forms of loss are accepted: the tables
//! are advisory input for dictionary mining, not a correctness oracle.

use crate::dictionary::DictionaryEntry;
use rand::Rng;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// Operand widths the integer tables exist for, and the element widths the
/// buffer table can be mined with.
pub trait CmpOperand:
    Copy + Eq + Ord + Hash + Debug + Default + sealed::Sealed + 'static
{
    const WIDTH: usize;
    const MIN: Self;
    const MAX: Self;

    /// Reads one operand from the first `WIDTH` bytes, little-endian.
    fn read_le(bytes: &[u8]) -> Self;

    /// Appends the operand's `WIDTH` bytes, little-endian.
    fn write_le(self, out: &mut Vec<u8>);

    /// The integer table dedicated to this width.
    fn table_of(tables: &TablesOfRecentCompares) -> &TableOfRecentCompares<Self>;

    fn table_of_mut(tables: &mut TablesOfRecentCompares) -> &mut TableOfRecentCompares<Self>;
}

impl CmpOperand for u8 {
    const WIDTH: usize = 1;
    const MIN: Self = u8::MIN;
    const MAX: Self = u8::MAX;

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0]
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn table_of(tables: &TablesOfRecentCompares) -> &TableOfRecentCompares<Self> {
        &tables.i8_table
    }

    fn table_of_mut(tables: &mut TablesOfRecentCompares) -> &mut TableOfRecentCompares<Self> {
        &mut tables.i8_table
    }
}

impl CmpOperand for u16 {
    const WIDTH: usize = 2;
    const MIN: Self = u16::MIN;
    const MAX: Self = u16::MAX;

    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&bytes[..2]);
        u16::from_le_bytes(raw)
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn table_of(tables: &TablesOfRecentCompares) -> &TableOfRecentCompares<Self> {
        &tables.i16_table
    }

    fn table_of_mut(tables: &mut TablesOfRecentCompares) -> &mut TableOfRecentCompares<Self> {
        &mut tables.i16_table
    }
}

impl CmpOperand for u32 {
    const WIDTH: usize = 4;
    const MIN: Self = u32::MIN;
    const MAX: Self = u32::MAX;

    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        u32::from_le_bytes(raw)
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn table_of(tables: &TablesOfRecentCompares) -> &TableOfRecentCompares<Self> {
        &tables.i32_table
    }

    fn table_of_mut(tables: &mut TablesOfRecentCompares) -> &mut TableOfRecentCompares<Self> {
        &mut tables.i32_table
    }
}

impl CmpOperand for u64 {
    const WIDTH: usize = 8;
    const MIN: Self = u64::MIN;
    const MAX: Self = u64::MAX;

    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        u64::from_le_bytes(raw)
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn table_of(tables: &TablesOfRecentCompares) -> &TableOfRecentCompares<Self> {
        &tables.i64_table
    }

    fn table_of_mut(tables: &mut TablesOfRecentCompares) -> &mut TableOfRecentCompares<Self> {
        &mut tables.i64_table
    }
}

/// One recorded comparison: both operands, in call order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompareEntry<T> {
    pub lhs: T,
    pub rhs: T,
}

/// Advances a rotating table cursor with the (37, 89) linear-congruential
/// recurrence. All table sizes are powers of two, so the mask is an exact
/// modulus.
fn advance_cursor(cursor: usize, table_size: usize) -> usize {
    debug_assert!(table_size.is_power_of_two());
    cursor.wrapping_mul(37).wrapping_add(89) & (table_size - 1)
}

/// A fixed-size table of recent integer comparison operand pairs for one
/// operand width. Holds `4096 / size_of::<T>()` zero-initialized entries.
pub struct TableOfRecentCompares<T: CmpOperand> {
    entries: Vec<CompareEntry<T>>,
    insert_index: usize,
}

impl<T: CmpOperand> TableOfRecentCompares<T> {
    /// One page worth of entries.
    pub const TABLE_SIZE: usize = 4096 / T::WIDTH;

    pub fn new() -> Self {
        Self {
            entries: vec![CompareEntry::default(); Self::TABLE_SIZE],
            insert_index: 0,
        }
    }

    /// Records the operand pair of one executed comparison at the next
    /// cursor position, overwriting whatever was there.
    pub fn insert(&mut self, lhs: T, rhs: T) {
        self.insert_index = advance_cursor(self.insert_index, Self::TABLE_SIZE);
        self.entries[self.insert_index] = CompareEntry { lhs, rhs };
    }

    /// Returns every distinct value that some slot pairs with `val`, limited
    /// to `[min, max]`. Pass `T::MIN`/`T::MAX` for the full width.
    ///
    /// The result is de-duplicated and sorted, so it is independent of slot
    /// order.
    pub fn matching_values(&self, val: T, min: T, max: T) -> Vec<T> {
        let mut matches = HashSet::new();
        for idx in 0..Self::TABLE_SIZE {
            if let Some(other) = self.matching_value_at(val, idx, min, max) {
                matches.insert(other);
            }
        }
        let mut matches: Vec<T> = matches.into_iter().collect();
        matches.sort_unstable();
        matches
    }

    /// The other side of slot `idx` if one side equals `val` and the other
    /// lies in `[min, max]`: for `val = 5` and the pair `(5, 10)`, returns 10.
    pub fn matching_value_at(&self, val: T, idx: usize, min: T, max: T) -> Option<T> {
        let entry = self.entries[idx];
        let other = if entry.lhs == val {
            entry.rhs
        } else if entry.rhs == val {
            entry.lhs
        } else {
            return None;
        };
        (min <= other && other <= max).then_some(other)
    }

    /// A uniformly chosen slot's pair.
    pub fn random_entry(&self, rng: &mut impl Rng) -> CompareEntry<T> {
        self.entries[rng.random_range(0..Self::TABLE_SIZE)]
    }

    /// One side of slot `idx`, chosen by a fair coin, if it lies in
    /// `[min, max]`.
    pub fn random_side(&self, rng: &mut impl Rng, idx: usize, min: T, max: T) -> Option<T> {
        let entry = self.entries[idx];
        let side = if rng.random_bool(0.5) {
            entry.lhs
        } else {
            entry.rhs
        };
        (min <= side && side <= max).then_some(side)
    }

    pub fn entries(&self) -> &[CompareEntry<T>] {
        &self.entries
    }

    /// Zeroes all slots and rewinds the cursor. The backing storage is kept.
    pub fn clear(&mut self) {
        self.entries.fill(CompareEntry::default());
        self.insert_index = 0;
    }
}

impl<T: CmpOperand> Default for TableOfRecentCompares<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One recorded buffer comparison. The buffers are 8-byte aligned so torn
/// concurrent writes still leave well-formed (if garbage) prefixes.
#[derive(Clone, Copy)]
#[repr(C, align(8))]
pub struct ComparedBufferEntry {
    buf1: [u8; BufferTorc::ENTRY_SIZE],
    buf2: [u8; BufferTorc::ENTRY_SIZE],
    len: usize,
}

impl ComparedBufferEntry {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes1(&self) -> &[u8] {
        &self.buf1[..self.len]
    }

    pub fn bytes2(&self) -> &[u8] {
        &self.buf2[..self.len]
    }

    /// Searches the entry against `val` (element width `size_of::<T>()`).
    ///
    /// If this entry's first buffer occurs in `val` as an element-aligned
    /// contiguous subsequence, the second buffer is the hint to splice at
    /// that position, and vice versa. Slots whose length is zero, not a
    /// multiple of the element width, or longer than `val` cannot match.
    pub fn matching_entry<T: CmpOperand>(&self, val: &[T]) -> Option<DictionaryEntry<T>> {
        match_buffer_pair(val, self.bytes1(), self.bytes2())
    }

    /// One of the entry's two buffers, chosen by a fair coin, as a
    /// dictionary entry without a position hint. Subject to the same element
    /// width filter as matching.
    pub fn random_side<T: CmpOperand>(&self, rng: &mut impl Rng) -> Option<DictionaryEntry<T>> {
        if self.len == 0 || self.len % T::WIDTH != 0 {
            return None;
        }
        let side = if rng.random_bool(0.5) {
            self.bytes1()
        } else {
            self.bytes2()
        };
        Some(DictionaryEntry {
            position_hint: None,
            value: decode_elements(side),
        })
    }
}

impl Default for ComparedBufferEntry {
    fn default() -> Self {
        Self {
            buf1: [0; BufferTorc::ENTRY_SIZE],
            buf2: [0; BufferTorc::ENTRY_SIZE],
            len: 0,
        }
    }
}

/// Searches `buf1`/`buf2` (equal length) against `val`; the found side's
/// counterpart becomes the dictionary value.
pub(crate) fn match_buffer_pair<T: CmpOperand>(
    val: &[T],
    buf1: &[u8],
    buf2: &[u8],
) -> Option<DictionaryEntry<T>> {
    let len = buf1.len();
    debug_assert_eq!(len, buf2.len());
    if len == 0 || len % T::WIDTH != 0 || len > val.len() * T::WIDTH {
        return None;
    }
    let needle1 = decode_elements::<T>(buf1);
    if let Some(offset) = find_subsequence(val, &needle1) {
        return Some(DictionaryEntry {
            position_hint: Some(offset),
            value: decode_elements(buf2),
        });
    }
    let needle2 = decode_elements::<T>(buf2);
    if let Some(offset) = find_subsequence(val, &needle2) {
        return Some(DictionaryEntry {
            position_hint: Some(offset),
            value: needle1,
        });
    }
    None
}

fn decode_elements<T: CmpOperand>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::WIDTH).map(T::read_le).collect()
}

fn find_subsequence<T: Eq>(haystack: &[T], needle: &[T]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// A fixed-size table of recent buffer comparison arguments, i.e. the
/// operands of memcmp/strcmp-style calls inside the target.
pub struct BufferTorc {
    entries: Vec<ComparedBufferEntry>,
    insert_index: usize,
}

impl BufferTorc {
    pub const TABLE_SIZE: usize = 128;
    pub const ENTRY_SIZE: usize = 128;

    pub fn new() -> Self {
        Self {
            entries: vec![ComparedBufferEntry::default(); Self::TABLE_SIZE],
            insert_index: 0,
        }
    }

    /// Records the two compared buffers at the next cursor position. The
    /// stored length is the shorter of the two, capped at
    /// `ENTRY_SIZE - 1` bytes.
    pub fn insert(&mut self, buf1: &[u8], buf2: &[u8]) {
        self.insert_index = advance_cursor(self.insert_index, Self::TABLE_SIZE);
        let n = buf1.len().min(buf2.len()).min(Self::ENTRY_SIZE - 1);
        let entry = &mut self.entries[self.insert_index];
        entry.len = n;
        entry.buf1[..n].copy_from_slice(&buf1[..n]);
        entry.buf2[..n].copy_from_slice(&buf2[..n]);
    }

    /// All distinct dictionary entries obtained by matching every slot
    /// against `val`. See [`ComparedBufferEntry::matching_entry`].
    pub fn matching_entries<T: CmpOperand>(&self, val: &[T]) -> Vec<DictionaryEntry<T>> {
        let mut found = HashSet::new();
        for entry in &self.entries {
            if let Some(matched) = entry.matching_entry(val) {
                found.insert(matched);
            }
        }
        found.into_iter().collect()
    }

    pub fn random_entry(&self, rng: &mut impl Rng) -> &ComparedBufferEntry {
        &self.entries[rng.random_range(0..Self::TABLE_SIZE)]
    }

    pub fn entries(&self) -> &[ComparedBufferEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.fill(ComparedBufferEntry::default());
        self.insert_index = 0;
    }
}

impl Default for BufferTorc {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-thread (or per-process, after merging) aggregate of all compare
/// tables: one integer table per operand width plus the buffer table.
///
/// Process-lifetime object; reset between fuzzing iterations with
/// [`TablesOfRecentCompares::clear`], never reallocated.
#[derive(Default)]
pub struct TablesOfRecentCompares {
    i8_table: TableOfRecentCompares<u8>,
    i16_table: TableOfRecentCompares<u16>,
    i32_table: TableOfRecentCompares<u32>,
    i64_table: TableOfRecentCompares<u64>,
    buffer_table: BufferTorc,
}

impl TablesOfRecentCompares {
    pub fn new() -> Self {
        Self::default()
    }

    /// The integer table for operand width `size_of::<T>()`.
    pub fn integers<T: CmpOperand>(&self) -> &TableOfRecentCompares<T> {
        T::table_of(self)
    }

    pub fn integers_mut<T: CmpOperand>(&mut self) -> &mut TableOfRecentCompares<T> {
        T::table_of_mut(self)
    }

    pub fn buffers(&self) -> &BufferTorc {
        &self.buffer_table
    }

    pub fn buffers_mut(&mut self) -> &mut BufferTorc {
        &mut self.buffer_table
    }

    pub fn clear(&mut self) {
        self.i8_table.clear();
        self.i16_table.clear();
        self.i32_table.clear();
        self.i64_table.clear();
        self.buffer_table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn table_sizes_scale_with_operand_width() {
        assert_eq!(TableOfRecentCompares::<u8>::TABLE_SIZE, 4096);
        assert_eq!(TableOfRecentCompares::<u16>::TABLE_SIZE, 2048);
        assert_eq!(TableOfRecentCompares::<u32>::TABLE_SIZE, 1024);
        assert_eq!(TableOfRecentCompares::<u64>::TABLE_SIZE, 512);
    }

    #[test]
    fn integer_match_finds_both_sides_and_filters_by_range() {
        let mut table = TableOfRecentCompares::<u32>::new();
        table.insert(0xDEADBEEF, 0xCAFEBABE);
        table.insert(42, 99);

        let matches = table.matching_values(0xDEADBEEF, u32::MIN, u32::MAX);
        assert!(matches.contains(&0xCAFEBABE));

        let reverse = table.matching_values(0xCAFEBABE, u32::MIN, u32::MAX);
        assert!(reverse.contains(&0xDEADBEEF), "matching is symmetric");

        assert!(
            table.matching_values(42, 0, 50).is_empty(),
            "99 lies outside [0, 50]"
        );
        assert!(table.matching_values(42, 0, 100).contains(&99));
    }

    #[test]
    fn integer_match_deduplicates() {
        let mut table = TableOfRecentCompares::<u16>::new();
        for _ in 0..20 {
            table.insert(7, 1234);
        }
        table.insert(1234, 7);
        let matches = table.matching_values(7, u16::MIN, u16::MAX);
        assert_eq!(matches, vec![1234]);
    }

    #[test]
    fn zero_matches_everywhere_in_a_fresh_table() {
        // A zeroed table pairs 0 with 0 in every slot; the mining layer is
        // expected to treat such matches as advisory garbage.
        let table = TableOfRecentCompares::<u8>::new();
        assert_eq!(table.matching_values(0, u8::MIN, u8::MAX), vec![0]);
        assert!(table.matching_values(1, u8::MIN, u8::MAX).is_empty());
    }

    #[test]
    fn insert_cursor_walks_the_lcg_orbit() {
        let mut table = TableOfRecentCompares::<u64>::new();
        // First insert lands at (0 * 37 + 89) mod 512 = 89, second at
        // (89 * 37 + 89) mod 512 = 3382 mod 512.
        table.insert(1, 2);
        assert_eq!(table.entries()[89], CompareEntry { lhs: 1, rhs: 2 });
        table.insert(3, 4);
        assert_eq!(table.entries()[3382 % 512], CompareEntry { lhs: 3, rhs: 4 });
    }

    #[test]
    fn random_side_returns_each_side_with_clamping() {
        let mut table = TableOfRecentCompares::<u32>::new();
        table.insert(5, 500);
        let idx = 89; // first cursor position
        let mut rng = ChaCha8Rng::from_seed([7; 32]);

        let mut sides = std::collections::HashSet::new();
        for _ in 0..64 {
            if let Some(side) = table.random_side(&mut rng, idx, u32::MIN, u32::MAX) {
                sides.insert(side);
            }
        }
        assert_eq!(
            sides,
            [5u32, 500].into_iter().collect(),
            "a fair coin must eventually return both operands"
        );

        for _ in 0..64 {
            if let Some(side) = table.random_side(&mut rng, idx, 0, 100) {
                assert_eq!(side, 5, "500 is clamped out of [0, 100]");
            }
        }
    }

    #[test]
    fn clear_resets_entries_and_cursor() {
        let mut table = TableOfRecentCompares::<u8>::new();
        table.insert(1, 2);
        table.clear();
        assert!(table.matching_values(1, u8::MIN, u8::MAX).is_empty());
        table.insert(9, 8);
        assert_eq!(table.entries()[89], CompareEntry { lhs: 9, rhs: 8 });
    }

    #[test]
    fn buffer_insert_clamps_length_and_matches_aligned_subsequences() {
        let mut torc = BufferTorc::new();
        torc.insert(b"PASSWORD", b"hunter2=");

        let val: Vec<u8> = b"XPASSWORD!".to_vec();
        let matches = torc.matching_entries::<u8>(&val);
        assert_eq!(
            matches,
            vec![DictionaryEntry {
                position_hint: Some(1),
                value: b"hunter2=".to_vec(),
            }]
        );

        // Finding the second buffer yields the first as the value.
        let val2: Vec<u8> = b"__hunter2=__".to_vec();
        let matches2 = torc.matching_entries::<u8>(&val2);
        assert_eq!(
            matches2,
            vec![DictionaryEntry {
                position_hint: Some(2),
                value: b"PASSWORD".to_vec(),
            }]
        );
    }

    #[test]
    fn buffer_insert_caps_stored_length() {
        let mut torc = BufferTorc::new();
        let long = vec![0xAA; 300];
        torc.insert(&long, &long);
        let stored = torc
            .entries()
            .iter()
            .find(|entry| entry.len() != 0)
            .expect("insert must land somewhere");
        assert_eq!(stored.len(), BufferTorc::ENTRY_SIZE - 1);
    }

    #[test]
    fn zero_length_buffer_pair_produces_no_matches() {
        let mut torc = BufferTorc::new();
        torc.insert(b"", b"");
        let val: Vec<u8> = b"anything".to_vec();
        assert!(torc.matching_entries::<u8>(&val).is_empty());
    }

    #[test]
    fn buffer_match_respects_element_width() {
        let mut torc = BufferTorc::new();
        // 6 bytes: fine for u8/u16 elements, unusable for u32.
        torc.insert(&[1, 0, 2, 0, 3, 0], &[9, 0, 8, 0, 7, 0]);

        let val16: Vec<u16> = vec![100, 1, 2, 3, 200];
        let matches16 = torc.matching_entries::<u16>(&val16);
        assert_eq!(
            matches16,
            vec![DictionaryEntry {
                position_hint: Some(1),
                value: vec![9u16, 8, 7],
            }]
        );

        let val32: Vec<u32> = vec![1, 2, 3];
        assert!(
            torc.matching_entries::<u32>(&val32).is_empty(),
            "6 bytes is not a whole number of u32 elements"
        );
    }

    #[test]
    fn buffer_match_requires_element_alignment() {
        let mut torc = BufferTorc::new();
        torc.insert(&[2u8, 0, 3, 0], &[8, 0, 7, 0]);
        // As u16 elements the needle is [2, 3]; in this haystack the byte
        // pattern occurs only at an odd byte offset, which is not an
        // element boundary.
        let val: Vec<u16> = vec![0x0200, 0x0300, 0x0004];
        assert!(torc.matching_entries::<u16>(&val).is_empty());
    }

    #[test]
    fn buffer_random_side_returns_one_of_the_buffers() {
        let mut torc = BufferTorc::new();
        torc.insert(b"leftside", b"rightsid");
        let entry = torc
            .entries()
            .iter()
            .find(|entry| entry.len() != 0)
            .expect("insert must land somewhere");

        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let side = entry
                .random_side::<u8>(&mut rng)
                .expect("8 bytes is u8-aligned");
            assert_eq!(side.position_hint, None);
            seen.insert(side.value);
        }
        assert_eq!(seen.len(), 2, "both buffers must eventually be drawn");
    }

    #[test]
    fn aggregate_routes_by_operand_width() {
        let mut tables = TablesOfRecentCompares::new();
        tables.integers_mut::<u16>().insert(10, 20);
        tables.integers_mut::<u64>().insert(30, 40);
        tables.buffers_mut().insert(b"abcd", b"efgh");

        assert!(tables
            .integers::<u16>()
            .matching_values(10, u16::MIN, u16::MAX)
            .contains(&20));
        assert!(tables
            .integers::<u64>()
            .matching_values(30, u64::MIN, u64::MAX)
            .contains(&40));
        assert!(tables
            .integers::<u32>()
            .matching_values(10, 1, u32::MAX)
            .is_empty());

        tables.clear();
        assert!(tables
            .integers::<u16>()
            .matching_values(10, u16::MIN, u16::MAX)
            .is_empty());
        assert!(tables.buffers().matching_entries::<u8>(b"abcd").is_empty());
    }
}
