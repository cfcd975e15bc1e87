//! VM tunables

/// Nanoseconds per second
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Tunables shared by every hierarchy built on one [`VmContext`].
///
/// [`VmContext`]: crate::mach_vm::VmContext
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Per-page pin ceiling
    pub max_pin_count: u32,
    /// Minimum time an unlocked discardable object stays reclaimable
    /// before the reclaimer may discard it
    pub discard_min_dwell_ns: u64,
    /// Contiguous absent pages requested from a pager on a hardware fault
    pub pager_readahead_pages: u32,
    /// Frames in the reference page manager
    pub total_pages: u32,
}

impl VmConfig {
    pub const fn new() -> Self {
        Self {
            max_pin_count: 31,
            discard_min_dwell_ns: 5 * NSEC_PER_SEC,
            pager_readahead_pages: 4,
            total_pages: 4096,
        }
    }

    pub const fn with_total_pages(mut self, total_pages: u32) -> Self {
        self.total_pages = total_pages;
        self
    }

    pub const fn with_max_pin_count(mut self, max_pin_count: u32) -> Self {
        self.max_pin_count = max_pin_count;
        self
    }

    pub const fn with_readahead(mut self, pages: u32) -> Self {
        self.pager_readahead_pages = pages;
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.max_pin_count, 31);
        assert_eq!(config.discard_min_dwell_ns, 5 * NSEC_PER_SEC);
        assert_eq!(config.pager_readahead_pages, 4);
        assert_eq!(config.total_pages, 4096);
    }

    #[test]
    fn test_builders() {
        let config = VmConfig::new().with_total_pages(16).with_max_pin_count(2);
        assert_eq!(config.total_pages, 16);
        assert_eq!(config.max_pin_count, 2);
    }
}
