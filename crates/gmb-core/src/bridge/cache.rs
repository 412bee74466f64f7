//! Running accumulation of business records and stats.
//!
//! The worker is supposed to end with a `complete` event that carries the
//! full business list and final stats. When it does not, the cache fills the
//! gaps from what was seen earlier in the sequence.

use std::time::Instant;

use tracing::warn;

use crate::event::{BusinessRecord, Event, EventKind, Stats};

#[derive(Debug, Clone)]
pub struct ResultCache {
    businesses: Vec<BusinessRecord>,
    last_stats: Option<Stats>,
    started: Instant,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    pub fn new() -> Self {
        Self {
            businesses: Vec::new(),
            last_stats: None,
            started: Instant::now(),
        }
    }

    /// Record the payload of `business`, `business_updated` and
    /// `stats_update` events. Other events are ignored.
    pub fn observe(&mut self, event: &Event) {
        match &event.kind {
            EventKind::Business { data } => self.businesses.push(data.clone()),
            EventKind::BusinessUpdated { data } => {
                match self
                    .businesses
                    .iter_mut()
                    .find(|b| b.identity() == data.identity())
                {
                    Some(existing) => *existing = data.clone(),
                    None => self.businesses.push(data.clone()),
                }
            }
            EventKind::StatsUpdate(stats) => self.last_stats = Some(stats.clone()),
            _ => {}
        }
    }

    /// Fill an incomplete `complete` event from the cache. An empty business
    /// list counts as missing. Declared stats that contradict themselves are
    /// recounted. Non-`complete` events pass through untouched.
    pub fn fill_complete(&self, mut event: Event) -> Event {
        let mut edited = false;
        if let EventKind::Complete { stats, businesses } = &mut event.kind {
            if businesses.is_empty() && !self.businesses.is_empty() {
                *businesses = self.businesses.clone();
                edited = true;
            }
            let checked = match stats.take() {
                Some(declared) => {
                    edited |= !declared.is_consistent();
                    reconcile(declared, businesses, "complete")
                }
                None => {
                    edited = true;
                    self.current_stats_for(businesses)
                }
            };
            *stats = Some(checked);
        }
        if edited {
            event.sync_raw(&["stats", "businesses"]);
        }
        event
    }

    /// `observe` followed by `fill_complete`.
    pub fn absorb(&mut self, event: Event) -> Event {
        self.observe(&event);
        self.fill_complete(event)
    }

    pub fn businesses(&self) -> &[BusinessRecord] {
        &self.businesses
    }

    /// Stats for what has been accumulated so far: the last reported stats
    /// if any, otherwise a tally of the cached records.
    pub fn current_stats(&self) -> Stats {
        self.current_stats_for(&self.businesses)
    }

    fn current_stats_for(&self, businesses: &[BusinessRecord]) -> Stats {
        match &self.last_stats {
            Some(stats) => reconcile(stats.clone(), businesses, "stats_update"),
            None => self.tally(businesses),
        }
    }

    /// Consume the cache, returning `(stats, businesses)`.
    pub fn into_parts(self) -> (Stats, Vec<BusinessRecord>) {
        let stats = self.current_stats();
        (stats, self.businesses)
    }

    fn tally(&self, businesses: &[BusinessRecord]) -> Stats {
        Stats::tally(businesses, 0, self.started.elapsed().as_secs_f64())
    }
}

/// Keep worker-reported stats unless a `with_*` counter exceeds `total`, in
/// which case recount from `businesses`.
fn reconcile(stats: Stats, businesses: &[BusinessRecord], source: &str) -> Stats {
    if stats.is_consistent() {
        return stats;
    }
    warn!(
        source,
        total = stats.total,
        businesses = businesses.len(),
        "worker stats are inconsistent, recounting"
    );
    Stats::tally(businesses, stats.filtered_out, stats.duration_seconds)
}
