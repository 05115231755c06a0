//! Page-hotness aggregation over delivered samples. A consumer-side policy
//! layer: the monitoring core hands it decoded samples and it keeps per-page
//! access counts, classifying pages as hot or cold at the caller's cadence.

use crate::channel::Sample;
use std::collections::HashMap;
use std::time::Instant;

const PAGE_SHIFT: u64 = 12;

#[derive(Debug, Clone)]
pub struct PageStats {
    pub access_count: u32,
    pub last_access: Instant,
    pub hot: bool,
}

/// Result of one classification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifySummary {
    pub hot_pages: usize,
    pub cold_pages: usize,
    pub accesses: u64,
}

/// Per-page access tracker. State is owned by the caller; independent
/// monitoring instances each carry their own tracker.
pub struct PageTracker {
    pages: HashMap<u64, PageStats>,
    hot_threshold: u32,
}

impl PageTracker {
    /// `hot_threshold`: accesses within one classification interval beyond
    /// which a page counts as hot.
    pub fn new(hot_threshold: u32) -> Self {
        PageTracker {
            pages: HashMap::new(),
            hot_threshold,
        }
    }

    pub fn record(&mut self, sample: &Sample) {
        let page = sample.address >> PAGE_SHIFT;
        let stats = self.pages.entry(page).or_insert(PageStats {
            access_count: 0,
            last_access: Instant::now(),
            hot: false,
        });
        stats.access_count += 1;
        stats.last_access = Instant::now();
    }

    /// Classify every tracked page against the threshold and reset the
    /// per-interval access counts.
    pub fn classify(&mut self) -> ClassifySummary {
        let mut summary = ClassifySummary {
            hot_pages: 0,
            cold_pages: 0,
            accesses: 0,
        };
        for stats in self.pages.values_mut() {
            summary.accesses += u64::from(stats.access_count);
            stats.hot = stats.access_count > self.hot_threshold;
            if stats.hot {
                summary.hot_pages += 1;
            } else {
                summary.cold_pages += 1;
            }
            stats.access_count = 0;
        }
        summary
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Pages currently classified as hot, from the most recent pass.
    pub fn hot_pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages
            .iter()
            .filter(|(_, s)| s.hot)
            .map(|(&page, _)| page)
    }
}
