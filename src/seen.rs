use std::collections::HashSet;

/// Two-window "recently seen" filter keyed by xxh3 fingerprints.
///
/// Membership is checked against both windows; `rotate` drops the older one.
/// Memory stays bounded by two windows worth of 8-byte fingerprints.
pub struct RollingSet {
    current: HashSet<u64>,
    previous: HashSet<u64>,
    max_per_window: usize,
}

impl RollingSet {
    pub fn new(max_per_window: usize) -> Self {
        Self {
            current: HashSet::new(),
            previous: HashSet::new(),
            max_per_window: max_per_window.max(1),
        }
    }

    pub fn rotate(&mut self) {
        self.previous = std::mem::take(&mut self.current);
    }

    /// Returns `true` the first time a key shows up within the live windows.
    ///
    /// A full current window is rotated first, so under sustained overflow
    /// a key can be accepted again sooner than two `rotate` calls.
    pub fn test_and_set(&mut self, key: &[u8]) -> bool {
        let fp = xxhash_rust::xxh3::xxh3_64(key);
        if self.current.contains(&fp) || self.previous.contains(&fp) {
            return false;
        }
        if self.current.len() >= self.max_per_window {
            self.rotate();
        }
        self.current.insert(fp);
        true
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let fp = xxhash_rust::xxh3::xxh3_64(key);
        self.current.contains(&fp) || self.previous.contains(&fp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_repeats_until_two_rotations() {
        let mut s = RollingSet::new(100);
        assert!(s.test_and_set(b"a"));
        assert!(!s.test_and_set(b"a"));
        s.rotate();
        assert!(!s.test_and_set(b"a"));
        s.rotate();
        assert!(s.test_and_set(b"a"));
    }

    #[test]
    fn full_window_rotates_itself() {
        let mut s = RollingSet::new(2);
        assert!(s.test_and_set(b"a"));
        assert!(s.test_and_set(b"b"));
        assert!(s.test_and_set(b"c")); // rotates: previous={a,b}, current={c}
        assert!(s.contains(b"a"));
        assert!(s.test_and_set(b"d"));
        assert!(s.test_and_set(b"e")); // rotates again; a and b are gone
        assert!(!s.contains(b"a"));
        assert!(s.contains(b"c"));
    }

    #[test]
    fn overflow_readmits_a_key_without_any_tick() {
        let mut s = RollingSet::new(2);
        assert!(s.test_and_set(b"pair"));
        for key in [b"k1", b"k2", b"k3", b"k4"] {
            assert!(s.test_and_set(key));
        }
        // Two capacity rotations happened and no explicit `rotate`.
        assert!(s.test_and_set(b"pair"));
    }
}
