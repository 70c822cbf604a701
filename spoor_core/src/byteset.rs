use std::sync::atomic::{AtomicU8, Ordering};

/// Capability set shared by all coverage byte-sets.
///
/// A byte-set is a flat array of byte-sized counters addressed by integer
/// index. Instrumented target code records observations through `set` and
/// `saturated_increment`, which may be called concurrently from any number of
/// threads. A collector later drains the set with `for_each_nonzero`.
///
/// The drain and `clear` take `&mut self`: exclusive access is exactly the
/// quiescence the drain requires, so the borrow checker rules out a drain
/// overlapping a writer or another drain.
pub trait ByteSet {
    /// Total number of byte slots in the set.
    const SIZE_IN_BYTES: usize;
    /// Drain range bounds must be multiples of this.
    const SIZE_MULTIPLE: usize;

    /// Stores `value` at `idx` with relaxed ordering.
    ///
    /// May be called concurrently with any other `set` or
    /// `saturated_increment`. Panics if `idx` is out of range.
    fn set(&self, idx: usize, value: u8);

    /// Increments the byte at `idx` unless it is already 255.
    ///
    /// The load/store pair is deliberately non-atomic under the relaxed
    /// model: concurrent increments of the same byte may lose updates, but
    /// the counter can never wrap past 255. Panics if `idx` is out of range.
    fn saturated_increment(&self, idx: usize);

    /// Resets every byte to zero.
    fn clear(&mut self);

    /// Calls `action(index, value)` for every non-zero byte in
    /// `[from, to)`, then zeroes each visited byte.
    ///
    /// `from` and `to` must be multiples of `SIZE_MULTIPLE` and lie within
    /// `[0, SIZE_IN_BYTES]`; violations panic.
    fn for_each_nonzero(&mut self, action: impl FnMut(usize, u8), from: usize, to: usize);
}

/// A fixed-size concurrent byte-set of `N` bytes, `N` a multiple of 64.
///
/// Writers go through relaxed single-byte atomic stores; the drain walks the
/// array one machine word at a time, skipping all-zero words, so its cost is
/// dominated by the touched portion of the map.
///
/// `new` is `const fn`, so instances can be placed in statics and are then
/// zero-initialized in the process image before any instrumentation callback
/// can run.
#[repr(align(64))]
pub struct ConcurrentByteSet<const N: usize> {
    bytes: [AtomicU8; N],
}

const WORD_SIZE: usize = size_of::<usize>();

impl<const N: usize> ConcurrentByteSet<N> {
    /// Creates an all-zero byte-set.
    pub const fn new() -> Self {
        assert!(N > 0, "byte-set size must be non-zero");
        assert!(N % 64 == 0, "byte-set size must be a multiple of 64");
        Self {
            bytes: [const { AtomicU8::new(0) }; N],
        }
    }
}

impl<const N: usize> Default for ConcurrentByteSet<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ByteSet for ConcurrentByteSet<N> {
    const SIZE_IN_BYTES: usize = N;
    const SIZE_MULTIPLE: usize = 64;

    fn set(&self, idx: usize, value: u8) {
        assert!(idx < N, "byte-set index {idx} out of range (size {N})");
        self.bytes[idx].store(value, Ordering::Relaxed);
    }

    fn saturated_increment(&self, idx: usize) {
        assert!(idx < N, "byte-set index {idx} out of range (size {N})");
        let counter = self.bytes[idx].load(Ordering::Relaxed);
        if counter != u8::MAX {
            self.bytes[idx].store(counter + 1, Ordering::Relaxed);
        }
    }

    fn clear(&mut self) {
        for byte in &mut self.bytes {
            *byte.get_mut() = 0;
        }
    }

    fn for_each_nonzero(&mut self, mut action: impl FnMut(usize, u8), from: usize, to: usize) {
        assert!(
            from % Self::SIZE_MULTIPLE == 0,
            "drain start {from} is not a multiple of {}",
            Self::SIZE_MULTIPLE
        );
        assert!(
            to % Self::SIZE_MULTIPLE == 0,
            "drain end {to} is not a multiple of {}",
            Self::SIZE_MULTIPLE
        );
        assert!(to <= N, "drain end {to} out of range (size {N})");
        assert!(from <= to, "drain start {from} past drain end {to}");

        // SAFETY: `&mut self` guarantees no concurrent writer exists, and
        // `AtomicU8` has the same layout as `u8`, so plain word-sized loads
        // and stores through this view are sound.
        let bytes: &mut [u8] = unsafe {
            std::slice::from_raw_parts_mut(self.bytes.as_mut_ptr().cast::<u8>(), N)
        };

        // 64 is a multiple of the word size on every supported host, so the
        // range splits into whole words.
        for (chunk_idx, chunk) in bytes[from..to].chunks_exact_mut(WORD_SIZE).enumerate() {
            let mut word_bytes = [0u8; WORD_SIZE];
            word_bytes.copy_from_slice(chunk);
            let word = usize::from_le_bytes(word_bytes);
            if word == 0 {
                continue;
            }
            chunk.fill(0);
            let base = from + chunk_idx * WORD_SIZE;
            for pos in 0..WORD_SIZE {
                // `from_le_bytes` above fixes the in-word byte order, so this
                // shift selects memory byte `pos` on any host endianness.
                let value = (word >> (pos * 8)) as u8;
                if value != 0 {
                    action(base + pos, value);
                }
            }
        }
    }
}

/// A byte-set of two layers, upper and lower, with the lower holding the
/// actual counters.
///
/// Every write also sets a presence flag in the upper layer, whose size
/// divides the lower's. The drain first walks the upper layer and descends
/// into a lower chunk only when its flag is set, so drain cost is
/// proportional to the number of touched chunks rather than to the full map.
///
/// The upper layer is an over-approximation: a flag may be set while the
/// corresponding lower chunk is all-zero (e.g. after a value of 0 was
/// stored), but a non-zero lower byte always has its flag set.
///
/// Both layers are ordinary [`ByteSet`]s, so layered sets compose
/// recursively with static dispatch. The canonical configuration pairs a
/// lower layer with an upper layer 64 times smaller.
pub struct LayeredByteSet<U, L> {
    upper: U,
    lower: L,
}

impl<U: ByteSet, L: ByteSet> LayeredByteSet<U, L> {
    /// Number of lower-layer bytes covered by one upper-layer flag.
    pub const LAYER_RATIO: usize = L::SIZE_IN_BYTES / U::SIZE_IN_BYTES;

    // Evaluated once per instantiation; incompatible layer pairings fail to
    // compile instead of misdraining at runtime.
    const LAYERS_COMPATIBLE: () = {
        assert!(
            L::SIZE_IN_BYTES % U::SIZE_IN_BYTES == 0,
            "lower layer size must be a multiple of the upper layer size"
        );
        assert!(
            (L::SIZE_IN_BYTES / U::SIZE_IN_BYTES) % L::SIZE_MULTIPLE == 0,
            "layer ratio must be a multiple of the lower layer's size multiple"
        );
    };

    /// Wraps two existing layers.
    pub const fn new(upper: U, lower: L) -> Self {
        let () = Self::LAYERS_COMPATIBLE;
        Self { upper, lower }
    }
}

impl<U: ByteSet, L: ByteSet> ByteSet for LayeredByteSet<U, L> {
    const SIZE_IN_BYTES: usize = L::SIZE_IN_BYTES;
    const SIZE_MULTIPLE: usize = U::SIZE_MULTIPLE * L::SIZE_MULTIPLE;

    fn set(&self, idx: usize, value: u8) {
        assert!(
            idx < Self::SIZE_IN_BYTES,
            "byte-set index {idx} out of range (size {})",
            Self::SIZE_IN_BYTES
        );
        self.upper.set(idx / Self::LAYER_RATIO, 1);
        self.lower.set(idx, value);
    }

    fn saturated_increment(&self, idx: usize) {
        assert!(
            idx < Self::SIZE_IN_BYTES,
            "byte-set index {idx} out of range (size {})",
            Self::SIZE_IN_BYTES
        );
        self.upper.set(idx / Self::LAYER_RATIO, 1);
        self.lower.saturated_increment(idx);
    }

    fn clear(&mut self) {
        self.upper.clear();
        self.lower.clear();
    }

    fn for_each_nonzero(&mut self, mut action: impl FnMut(usize, u8), from: usize, to: usize) {
        assert!(
            from % Self::SIZE_MULTIPLE == 0,
            "drain start {from} is not a multiple of {}",
            Self::SIZE_MULTIPLE
        );
        assert!(
            to % Self::SIZE_MULTIPLE == 0,
            "drain end {to} is not a multiple of {}",
            Self::SIZE_MULTIPLE
        );
        assert!(
            to <= Self::SIZE_IN_BYTES,
            "drain end {to} out of range (size {})",
            Self::SIZE_IN_BYTES
        );

        let ratio = Self::LAYER_RATIO;
        let Self { upper, lower } = self;
        upper.for_each_nonzero(
            |upper_idx, _flag| {
                let lower_from = upper_idx * ratio;
                lower.for_each_nonzero(&mut action, lower_from, lower_from + ratio);
            },
            from / ratio,
            to / ratio,
        );
    }
}
