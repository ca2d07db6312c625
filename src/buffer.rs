//! Transfer buffer sizing by file-size tier
//! Small payloads get a small buffer, multi-gigabyte wordlists get large ones

/// Largest size served by the small tier (1 MiB, inclusive)
pub const SMALL_TIER_MAX: u64 = 1024 * 1024;

/// Largest size served by the medium tier (100 MiB, inclusive)
pub const MEDIUM_TIER_MAX: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTier {
    Small,
    Medium,
    Large,
}

impl BufferTier {
    pub fn for_size(size: u64) -> Self {
        if size <= SMALL_TIER_MAX {
            BufferTier::Small
        } else if size <= MEDIUM_TIER_MAX {
            BufferTier::Medium
        } else {
            BufferTier::Large
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferSizer {
    small: usize,
    medium: usize,
    large: usize,
}

impl BufferSizer {
    pub fn new() -> Self {
        // Byte counts are tuning, not protocol: only the tier edges matter on the wire side
        BufferSizer {
            small: 64 * 1024,        // 64KB
            medium: 1024 * 1024,     // 1MB
            large: 8 * 1024 * 1024,  // 8MB
        }
    }

    pub fn with_sizes(small: usize, medium: usize, large: usize) -> Self {
        BufferSizer {
            small: small.max(1),
            medium: medium.max(1),
            large: large.max(1),
        }
    }

    pub fn tier(&self, file_size: u64) -> BufferTier {
        BufferTier::for_size(file_size)
    }

    /// Read/write loop buffer for a payload of `file_size` bytes
    pub fn buffer_size(&self, file_size: u64) -> usize {
        match self.tier(file_size) {
            BufferTier::Small => self.small,
            BufferTier::Medium => self.medium,
            BufferTier::Large => self.large,
        }
    }
}

impl Default for BufferSizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_switch_exactly_at_thresholds() {
        assert_eq!(BufferTier::for_size(0), BufferTier::Small);
        assert_eq!(BufferTier::for_size(SMALL_TIER_MAX), BufferTier::Small);
        assert_eq!(BufferTier::for_size(SMALL_TIER_MAX + 1), BufferTier::Medium);
        assert_eq!(BufferTier::for_size(MEDIUM_TIER_MAX), BufferTier::Medium);
        assert_eq!(BufferTier::for_size(MEDIUM_TIER_MAX + 1), BufferTier::Large);
        assert_eq!(BufferTier::for_size(u64::MAX), BufferTier::Large);
    }

    #[test]
    fn sizer_maps_tiers_to_buffers() {
        let sizer = BufferSizer::with_sizes(1, 2, 3);
        assert_eq!(sizer.buffer_size(SMALL_TIER_MAX), 1);
        assert_eq!(sizer.buffer_size(SMALL_TIER_MAX + 1), 2);
        assert_eq!(sizer.buffer_size(MEDIUM_TIER_MAX + 1), 3);
    }

    #[test]
    fn default_buffers_grow_with_tier() {
        let sizer = BufferSizer::default();
        let small = sizer.buffer_size(1);
        let medium = sizer.buffer_size(50 * 1024 * 1024);
        let large = sizer.buffer_size(4 * 1024 * 1024 * 1024);
        assert!(small < medium && medium < large);
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let sizer = BufferSizer::with_sizes(0, 0, 0);
        assert_eq!(sizer.buffer_size(0), 1);
    }
}
