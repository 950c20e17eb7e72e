//! Extends the 16-bit on-device timestamp into a monotonic value.

const WRAP_SPAN: u64 = 1 << 16;
/// A drop in the raw value only counts as a wrap when the previous sample
/// was this close to the ceiling.
const NEAR_TO_END_THRESHOLD: u64 = WRAP_SPAN - 100;

#[derive(Debug, Default, Clone)]
pub struct TimestampUnwrapper {
    overflows: u64,
    last_raw: u64,
}

impl TimestampUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwrap(&mut self, raw: u16) -> u64 {
        self.unwrap_raw(u64::from(raw))
    }

    /// Synthesizes the successor of the last seen value, for notifications
    /// that carry no timestamp.
    pub fn next(&mut self) -> u64 {
        self.unwrap_raw(self.last_raw + 1)
    }

    fn unwrap_raw(&mut self, raw: u64) -> u64 {
        if self.last_raw > NEAR_TO_END_THRESHOLD && raw < self.last_raw {
            self.overflows += 1;
        }
        self.last_raw = raw;
        self.overflows * WRAP_SPAN + raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_near_ceiling() {
        let mut unwrapper = TimestampUnwrapper::new();
        assert_eq!(unwrapper.unwrap(65400), 65400);
        assert_eq!(unwrapper.unwrap(65450), 65450);
        assert_eq!(unwrapper.unwrap(50), 65586);
    }

    #[test]
    fn test_drop_far_from_ceiling_is_not_a_wrap() {
        let mut unwrapper = TimestampUnwrapper::new();
        assert_eq!(unwrapper.unwrap(1000), 1000);
        assert_eq!(unwrapper.unwrap(10), 10);
    }

    #[test]
    fn test_monotonic_over_several_wraps() {
        let mut unwrapper = TimestampUnwrapper::new();
        let mut last = 0;
        for lap in 0..3u64 {
            for raw in [0u16, 20000, 40000, 65500, 65535] {
                let value = unwrapper.unwrap(raw);
                assert!(value >= last, "lap {lap}: {value} < {last}");
                last = value;
            }
        }
        assert_eq!(last, 2 * 65536 + 65535);
    }

    #[test]
    fn test_next_increments() {
        let mut unwrapper = TimestampUnwrapper::new();
        unwrapper.unwrap(10);
        assert_eq!(unwrapper.next(), 11);
        assert_eq!(unwrapper.next(), 12);
    }

    #[test]
    fn test_next_crosses_ceiling() {
        let mut unwrapper = TimestampUnwrapper::new();
        unwrapper.unwrap(65535);
        // successor of the ceiling is reported past the wrap point, not reset
        assert_eq!(unwrapper.next(), 65536);
    }
}
