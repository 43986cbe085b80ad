//! Request id allocation with wraparound and reuse rejection

use crate::protocol::RequestId;

/// Upper bound (exclusive) of the request id domain
pub const MAX_REQUEST_ID: RequestId = 1 << 40;

/// Restart multiplier applied to the overflow remainder on wraparound
const WRAP_MULTIPLIER: RequestId = 10;

/// Monotonic request id counter scoped to one session channel
#[derive(Debug, Clone)]
pub struct RequestIdAllocator {
    current: RequestId,
    max: RequestId,
}

impl RequestIdAllocator {
    /// Create an allocator over `[0, MAX_REQUEST_ID)`
    pub fn new() -> Self {
        Self::with_max(MAX_REQUEST_ID)
    }

    /// Create an allocator over `[0, max)`
    pub fn with_max(max: RequestId) -> Self {
        Self {
            current: 0,
            max: max.max(1),
        }
    }

    /// Value the next allocation starts from
    pub fn current(&self) -> RequestId {
        self.current
    }

    /// Exclusive upper bound of the id domain
    pub fn max(&self) -> RequestId {
        self.max
    }

    /// Allocate the next free id, skipping ids for which `in_use` holds
    ///
    /// `outstanding` is the number of ids currently in use; when it covers the
    /// whole domain there is nothing left to hand out. Returns `None` once
    /// every id is taken.
    pub fn allocate(
        &mut self,
        outstanding: usize,
        in_use: impl Fn(RequestId) -> bool,
    ) -> Option<RequestId> {
        if outstanding as u128 >= self.max as u128 {
            return None;
        }

        // After a wrap the counter cycles through [restart, max) only
        for _ in 0..self.max {
            let candidate = self.advance();
            if !in_use(candidate) {
                return Some(candidate);
            }
        }

        let low = (0..self.max).find(|id| !in_use(*id))?;
        self.current = low;
        self.advance();
        Some(low)
    }

    fn advance(&mut self) -> RequestId {
        let id = self.current;
        self.current += 1;
        if self.current >= self.max {
            // Restart above zero: the lowest ids belong to the oldest requests,
            // which are the most likely to still be outstanding.
            let remainder = self.current - self.max;
            self.current = (remainder + 1).saturating_mul(WRAP_MULTIPLIER) % self.max;
        }
        id
    }
}

impl Default for RequestIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sequential_ids_are_distinct() {
        let mut ids = RequestIdAllocator::new();
        let allocated: Vec<_> = (0..1000)
            .map(|_| ids.allocate(0, |_| false).unwrap())
            .collect();
        let unique: HashSet<_> = allocated.iter().copied().collect();

        assert_eq!(allocated[0], 0);
        assert_eq!(allocated[999], 999);
        assert_eq!(unique.len(), 1000);
    }

    #[test]
    fn test_wraparound_stays_below_max() {
        let mut ids = RequestIdAllocator::with_max(64);
        for expected in 0..64 {
            assert_eq!(ids.allocate(0, |_| false), Some(expected));
        }
        assert_eq!(ids.current(), 10);
        assert_eq!(ids.allocate(0, |_| false), Some(10));
    }

    #[test]
    fn test_wraparound_near_real_max() {
        let mut ids = RequestIdAllocator::new();
        ids.current = MAX_REQUEST_ID - 2;
        assert_eq!(ids.allocate(0, |_| false), Some(MAX_REQUEST_ID - 2));
        assert_eq!(ids.allocate(0, |_| false), Some(MAX_REQUEST_ID - 1));
        let next = ids.allocate(0, |_| false).unwrap();
        assert!(next < MAX_REQUEST_ID);
        assert_eq!(next, WRAP_MULTIPLIER);
    }

    #[test]
    fn test_wraparound_skips_outstanding_ids() {
        let mut ids = RequestIdAllocator::with_max(64);
        for _ in 0..64 {
            ids.allocate(0, |_| false);
        }
        let outstanding: HashSet<RequestId> = [10, 11, 13].into_iter().collect();
        let next = ids
            .allocate(outstanding.len(), |id| outstanding.contains(&id))
            .unwrap();
        assert_eq!(next, 12);
        let next = ids
            .allocate(outstanding.len(), |id| outstanding.contains(&id))
            .unwrap();
        assert_eq!(next, 14);
    }

    #[test]
    fn test_exhausted_domain() {
        let mut ids = RequestIdAllocator::with_max(4);
        assert_eq!(ids.allocate(4, |_| true), None);
        assert_eq!(ids.allocate(3, |id| id != 2), Some(2));
    }

    #[test]
    fn test_ids_below_restart_are_reachable_after_wrap() {
        let mut ids = RequestIdAllocator::with_max(16);
        for _ in 0..16 {
            ids.allocate(0, |_| false);
        }
        assert_eq!(ids.current(), 10);

        // Every id the wrapped counter cycles through is outstanding
        let outstanding: HashSet<RequestId> = (10..16).collect();
        let in_use = |id| outstanding.contains(&id);
        assert_eq!(ids.allocate(outstanding.len(), in_use), Some(0));
        assert_eq!(ids.allocate(outstanding.len(), |id| id == 0 || in_use(id)), Some(1));
    }

    #[test]
    fn test_full_scan_gives_up_when_nothing_is_free() {
        let mut ids = RequestIdAllocator::with_max(8);
        for _ in 0..8 {
            ids.allocate(0, |_| false);
        }
        // Outstanding count understates the table; the scan still terminates
        assert_eq!(ids.allocate(0, |_| true), None);
    }
}
