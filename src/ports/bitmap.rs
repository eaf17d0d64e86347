//! Fixed-size bitmap over a contiguous port range

use super::allocator::PortRange;

/// One bit per port in a range; set bits are allocated
#[derive(Debug, Clone)]
pub struct PortBitmap {
    base: u16,
    len: usize,
    words: Vec<u64>,
    allocated: usize,
}

impl PortBitmap {
    /// Empty bitmap covering `range`
    pub fn new(range: PortRange) -> Self {
        let len = range.len();
        Self {
            base: range.min,
            len,
            words: vec![0; len.div_ceil(64)],
            allocated: 0,
        }
    }

    fn index(&self, port: u16) -> Option<usize> {
        let offset = usize::from(port.checked_sub(self.base)?);
        (offset < self.len).then_some(offset)
    }

    /// Whether the port lies inside the range
    pub fn contains(&self, port: u16) -> bool {
        self.index(port).is_some()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.index(port)
            .map(|i| self.words[i / 64] & (1 << (i % 64)) != 0)
            .unwrap_or(false)
    }

    /// Mark a port allocated; returns false if out of range or already set
    pub fn mark(&mut self, port: u16) -> bool {
        let Some(i) = self.index(port) else {
            return false;
        };
        let bit = 1u64 << (i % 64);
        if self.words[i / 64] & bit != 0 {
            return false;
        }
        self.words[i / 64] |= bit;
        self.allocated += 1;
        true
    }

    /// Mark a port free; returns false if out of range or already free
    pub fn clear(&mut self, port: u16) -> bool {
        let Some(i) = self.index(port) else {
            return false;
        };
        let bit = 1u64 << (i % 64);
        if self.words[i / 64] & bit == 0 {
            return false;
        }
        self.words[i / 64] &= !bit;
        self.allocated -= 1;
        true
    }

    /// Lowest free port, if any
    pub fn first_free(&self) -> Option<u16> {
        self.words.iter().enumerate().find_map(|(w, word)| {
            if *word == u64::MAX {
                return None;
            }
            let i = w * 64 + (!word).trailing_zeros() as usize;
            // offsets fit in u16 because the range does
            (i < self.len).then(|| self.base + i as u16)
        })
    }

    /// The `n`th free port in ascending order, counting from zero
    pub fn nth_free(&self, n: usize) -> Option<u16> {
        let mut skipped = 0;
        for (w, word) in self.words.iter().enumerate() {
            let free = (!word).count_ones() as usize;
            if skipped + free <= n {
                skipped += free;
                continue;
            }
            let mut bits = !word;
            for _ in 0..(n - skipped) {
                bits &= bits - 1;
            }
            let i = w * 64 + bits.trailing_zeros() as usize;
            return (i < self.len).then(|| self.base + i as u16);
        }
        None
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn available(&self) -> usize {
        self.len - self.allocated
    }
}
