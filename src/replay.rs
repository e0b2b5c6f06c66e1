//! Replay protection
//!
//! Sliding 64-packet window over DATA sequence numbers. Sequence 0 is never
//! valid since counters start at 1 after every (re)key.

/// Sliding window for replay attack protection
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    last_counter: u64,
    bitmap: u64,
    window_size: u64,
}

impl ReplayWindow {
    /// Create a new replay window
    pub fn new() -> Self {
        ReplayWindow {
            last_counter: 0,
            bitmap: 0,
            window_size: 64,
        }
    }

    /// Would `counter` be accepted? Does not record it.
    pub fn check(&self, counter: u64) -> bool {
        if counter == 0 {
            return false;
        }
        if counter > self.last_counter {
            return true;
        }
        let diff = self.last_counter - counter;
        diff < self.window_size && self.bitmap & (1u64 << diff) == 0
    }

    /// Check and record in one step. Returns true if the packet should be
    /// accepted.
    #[inline]
    pub fn check_and_update(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }

        if counter > self.last_counter {
            let diff = counter - self.last_counter;
            if diff >= self.window_size {
                self.bitmap = 1;
            } else {
                self.bitmap <<= diff;
                self.bitmap |= 1;
            }
            self.last_counter = counter;
        } else {
            self.bitmap |= 1u64 << (self.last_counter - counter);
        }
        true
    }

    /// Highest sequence seen
    pub fn last(&self) -> u64 {
        self.last_counter
    }

    /// Reset window
    pub fn reset(&mut self) {
        self.last_counter = 0;
        self.bitmap = 0;
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
