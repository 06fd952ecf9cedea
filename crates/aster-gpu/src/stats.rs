//! Cache activity counters.
//!
//! Per-frame counters are plain fields on the one cache instance with a
//! defined reset point (`begin_frame`); this layer is single-threaded by
//! contract, so there is nothing to synchronize. Lifetime totals accumulate
//! across frames and survive resets.

/// Counters reset at the start of every frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub binds: u64,
    pub quick_hits: u64,
    pub full_hash_checks: u64,
    pub rebuilds: u64,
    pub texels_scaled: u64,
    pub framebuffer_binds: u64,
    pub self_sample_copies: u64,
    pub readbacks_sync: u64,
    pub readbacks_async: u64,
    pub invalidate_alls: u64,
}

/// Counters that accumulate for the life of the cache instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TotalStats {
    pub frames: u64,
    pub rebuilds: u64,
    pub evictions: u64,
    pub fb_created: u64,
    pub fb_evicted: u64,
    pub placeholder_binds: u64,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub frame: FrameStats,
    pub totals: TotalStats,
}

/// Point-in-time copy of both counter sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frame: FrameStats,
    pub totals: TotalStats,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds the finished frame's rebuild count into the totals and resets
    /// the per-frame counters.
    pub fn begin_frame(&mut self) {
        self.totals.frames += 1;
        self.totals.rebuilds += self.frame.rebuilds;
        self.frame = FrameStats::default();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frame: self.frame,
            totals: self.totals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_frame_resets_frame_counters_and_keeps_totals() {
        let mut stats = CacheStats::new();
        stats.frame.rebuilds = 3;
        stats.frame.binds = 10;
        stats.totals.evictions = 2;

        stats.begin_frame();
        assert_eq!(stats.frame, FrameStats::default());
        assert_eq!(stats.totals.rebuilds, 3);
        assert_eq!(stats.totals.evictions, 2);
        assert_eq!(stats.totals.frames, 1);
    }
}
