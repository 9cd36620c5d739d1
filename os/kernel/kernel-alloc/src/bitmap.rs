//! Word bitmaps backing the frame, paging-area and IO allocators.
//!
//! Bit = 0: free, bit = 1: in use.

/// A fixed-length bitmap over caller-provided `u32` words.
pub struct Bitmap<S> {
    words: S,
    bits: u32,
}

impl<S: AsRef<[u32]> + AsMut<[u32]>> Bitmap<S> {
    /// Wrap `words`, tracking the first `bits` bits. The words are cleared.
    ///
    /// ### Debug assertions
    /// - Asserts that `words` can hold `bits` bits.
    pub fn new(mut words: S, bits: u32) -> Self {
        debug_assert!(words.as_ref().len() * 32 >= bits as usize);
        words.as_mut().fill(0);
        Self { words, bits }
    }

    /// Number of words needed for `bits` bits.
    #[must_use]
    pub const fn words_for(bits: u32) -> usize {
        bits.div_ceil(32) as usize
    }

    #[must_use]
    pub const fn len(&self) -> u32 {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    #[inline]
    #[must_use]
    pub fn get(&self, i: u32) -> bool {
        debug_assert!(i < self.bits);
        self.words.as_ref()[(i / 32) as usize] & (1 << (i % 32)) != 0
    }

    #[inline]
    pub fn set(&mut self, i: u32) {
        debug_assert!(i < self.bits);
        self.words.as_mut()[(i / 32) as usize] |= 1 << (i % 32);
    }

    #[inline]
    pub fn clear(&mut self, i: u32) {
        debug_assert!(i < self.bits);
        self.words.as_mut()[(i / 32) as usize] &= !(1 << (i % 32));
    }

    /// Set `count` bits starting at `start`, clamped to the bitmap.
    pub fn set_range(&mut self, start: u32, count: u32) {
        for i in start..start.saturating_add(count).min(self.bits) {
            self.set(i);
        }
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_set(&self) -> u32 {
        let full = (self.bits / 32) as usize;
        let words = self.words.as_ref();
        let mut n: u32 = words[..full].iter().map(|w| w.count_ones()).sum();
        let tail = self.bits % 32;
        if tail != 0 {
            n += (words[full] & ((1 << tail) - 1)).count_ones();
        }
        n
    }

    /// First run of `count` clear bits at or after `hint`, wrapping around
    /// to the start once.
    #[must_use]
    pub fn find_clear_run(&self, count: u32, hint: u32) -> Option<u32> {
        if count == 0 || count > self.bits {
            return None;
        }
        let hint = if hint >= self.bits { 0 } else { hint };
        self.find_clear_run_in(count, hint, self.bits)
            .or_else(|| self.find_clear_run_in(count, 0, self.bits))
    }

    fn find_clear_run_in(&self, count: u32, from: u32, to: u32) -> Option<u32> {
        let words = self.words.as_ref();
        let mut run_start = from;
        let mut run = 0;
        let mut i = from;
        while i < to {
            // Skip words that are completely in use.
            if i % 32 == 0 && i + 32 <= to && words[(i / 32) as usize] == u32::MAX {
                i += 32;
                run = 0;
                run_start = i;
                continue;
            }
            if self.get(i) {
                run = 0;
                run_start = i + 1;
            } else {
                run += 1;
                if run == count {
                    return Some(run_start);
                }
            }
            i += 1;
        }
        None
    }
}

/// Bitmap allocator handing out runs of bits that are freed as a whole.
///
/// A second bitmap marks the first bit of every allocated run, so
/// [`free`](Self::free) needs nothing but the start index.
pub struct RunBitmap<S> {
    used: Bitmap<S>,
    heads: Bitmap<S>,
    hint: u32,
}

impl<S: AsRef<[u32]> + AsMut<[u32]>> RunBitmap<S> {
    pub fn new(used: S, heads: S, bits: u32) -> Self {
        Self {
            used: Bitmap::new(used, bits),
            heads: Bitmap::new(heads, bits),
            hint: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> u32 {
        self.used.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Allocate `count` consecutive bits and return the first index.
    pub fn alloc(&mut self, count: u32) -> Option<u32> {
        let start = self.used.find_clear_run(count, self.hint)?;
        self.used.set_range(start, count);
        self.heads.set(start);
        self.hint = start + count;
        Some(start)
    }

    /// Release the run starting at `start` and return its length.
    ///
    /// Returns `None` if `start` is not the first bit of an allocated run.
    pub fn free(&mut self, start: u32) -> Option<u32> {
        if start >= self.len() || !self.heads.get(start) {
            return None;
        }
        self.heads.clear(start);
        let mut i = start;
        while i < self.len() && self.used.get(i) && (i == start || !self.heads.get(i)) {
            self.used.clear(i);
            i += 1;
        }
        Some(i - start)
    }

    #[must_use]
    pub fn is_used(&self, i: u32) -> bool {
        self.used.get(i)
    }

    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.len() - self.used.count_set()
    }
}
