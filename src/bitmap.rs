//! Per-chunk boolean maps, resizable in lock-step with the image.
//!
//! A [`BitmapGroup`] tracks the current bit count and every map created from
//! it; resizing the group resizes all member maps together so a chunk index
//! valid for one map is valid for all of them.

use std::sync::Arc;

use parking_lot::Mutex;

const BITS_PER_WORD: u64 = 64;

fn words_for(bits: u64) -> usize {
    bits.div_ceil(BITS_PER_WORD) as usize
}

#[derive(Debug)]
struct MapInner {
    words: Mutex<Vec<u64>>,
    set_on_extend: bool,
}

#[derive(Debug)]
struct GroupInner {
    nbits: u64,
    maps: Vec<Arc<MapInner>>,
    closed: bool,
}

/// A set of equally sized bitmaps indexed by chunk.
#[derive(Debug)]
pub struct BitmapGroup {
    inner: Mutex<GroupInner>,
}

impl BitmapGroup {
    /// Create a group sized for `initial_bits` chunks.
    pub fn new(initial_bits: u64) -> Self {
        BitmapGroup {
            inner: Mutex::new(GroupInner {
                nbits: initial_bits,
                maps: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Create a new member map. Bits gained by a later extension start
    /// cleared, or set when `set_on_extend` is given.
    pub fn new_map(&self, set_on_extend: bool) -> Bitmap {
        let mut inner = self.inner.lock();
        let map = Arc::new(MapInner {
            words: Mutex::new(vec![0; words_for(inner.nbits)]),
            set_on_extend,
        });
        inner.maps.push(map.clone());
        Bitmap { map }
    }

    /// Resize every member map to `bits`. Shrinking discards high bits.
    pub fn resize(&self, bits: u64) {
        let mut inner = self.inner.lock();
        let old_bits = inner.nbits;
        inner.nbits = bits;
        for map in &inner.maps {
            let mut words = map.words.lock();
            words.resize(words_for(bits), 0);
            if bits > old_bits && map.set_on_extend {
                let mut bit = old_bits;
                while bit < bits {
                    words[(bit / BITS_PER_WORD) as usize] |= 1 << (bit % BITS_PER_WORD);
                    bit += 1;
                }
            } else if bits < old_bits && bits % BITS_PER_WORD != 0 {
                // Clear the discarded tail of the last word so a future
                // extension starts from zero bits.
                let mask = (1u64 << (bits % BITS_PER_WORD)) - 1;
                let last = words.len() - 1;
                words[last] &= mask;
            }
        }
    }

    /// Mark the group closed. Terminal; existing bits stay readable so
    /// in-flight chunk operations can finish.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
        }
    }

    /// Whether [`close`](Self::close) was called.
    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// One boolean per chunk. Clones share state.
#[derive(Debug, Clone)]
pub struct Bitmap {
    map: Arc<MapInner>,
}

impl Bitmap {
    /// Set the bit for `chunk`. Out-of-range indexes are ignored; the image
    /// size may legitimately have shrunk since the caller derived the index.
    pub fn set(&self, chunk: u64) {
        let mut words = self.map.words.lock();
        let word = (chunk / BITS_PER_WORD) as usize;
        if word < words.len() {
            words[word] |= 1 << (chunk % BITS_PER_WORD);
        }
    }

    /// Test the bit for `chunk`. Out-of-range indexes read as clear.
    pub fn test(&self, chunk: u64) -> bool {
        let words = self.map.words.lock();
        let word = (chunk / BITS_PER_WORD) as usize;
        match words.get(word) {
            Some(w) => w & (1 << (chunk % BITS_PER_WORD)) != 0,
            None => false,
        }
    }

    /// Index of the first clear bit, or `None` if all `nbits` are set.
    pub fn first_clear(&self, nbits: u64) -> Option<u64> {
        (0..nbits).find(|&bit| !self.test(bit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_test() {
        let group = BitmapGroup::new(10);
        let map = group.new_map(false);
        assert!(!map.test(3));
        map.set(3);
        assert!(map.test(3));
        assert!(!map.test(4));
        // Out of range reads as clear and sets are dropped.
        assert!(!map.test(100));
        map.set(100);
        assert!(!map.test(100));
    }

    #[test]
    fn resize_extends_with_zeros() {
        let group = BitmapGroup::new(4);
        let map = group.new_map(false);
        map.set(0);
        group.resize(200);
        assert!(map.test(0));
        for bit in 4..200 {
            assert!(!map.test(bit));
        }
    }

    #[test]
    fn resize_extends_with_ones_when_configured() {
        let group = BitmapGroup::new(4);
        let map = group.new_map(true);
        group.resize(70);
        assert!(!map.test(0));
        for bit in 4..70 {
            assert!(map.test(bit), "bit {bit} should be set on extend");
        }
    }

    #[test]
    fn shrink_discards_tail() {
        let group = BitmapGroup::new(70);
        let map = group.new_map(false);
        map.set(69);
        map.set(2);
        group.resize(3);
        group.resize(70);
        assert!(map.test(2));
        assert!(!map.test(69));
    }

    #[test]
    fn first_clear_scans_from_zero() {
        let group = BitmapGroup::new(5);
        let map = group.new_map(false);
        map.set(0);
        map.set(1);
        assert_eq!(map.first_clear(5), Some(2));
        for bit in 0..5 {
            map.set(bit);
        }
        assert_eq!(map.first_clear(5), None);
    }

    #[test]
    fn close_is_terminal() {
        let group = BitmapGroup::new(1);
        assert!(!group.is_closed());
        group.close();
        assert!(group.is_closed());
        group.close();
        assert!(group.is_closed());
    }
}
