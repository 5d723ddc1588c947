//! Hooks applied to every inbound delivery before consumers are resolved

pub mod resequencing;

pub use resequencing::ResequencingDeduplicationFilter;

use crate::context::CurrentMessageInformation;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Result of running a message through a filter
#[derive(Debug, Default)]
pub struct FilterOutcome {
    /// Messages to hand on, in order
    pub deliver: Vec<CurrentMessageInformation>,
    /// Messages to acknowledge without dispatching
    pub discard: Vec<CurrentMessageInformation>,
}

impl FilterOutcome {
    pub fn deliver(message: CurrentMessageInformation) -> Self {
        Self {
            deliver: vec![message],
            discard: Vec::new(),
        }
    }

    pub fn discard(message: CurrentMessageInformation) -> Self {
        Self {
            deliver: Vec::new(),
            discard: vec![message],
        }
    }

    /// Neither delivered nor discarded yet
    pub fn held() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deliver.is_empty() && self.discard.is_empty()
    }
}

/// A hook that may pass, hold, reorder or suppress inbound messages
pub trait MessageFilter: Send + Sync {
    /// Filter one inbound message
    fn filter(&self, message: CurrentMessageInformation, now: Instant) -> FilterOutcome;

    /// Release whatever is held past its deadline
    fn expire(&self, _now: Instant) -> FilterOutcome {
        FilterOutcome::default()
    }
}

/// Ordered filter chain, itself a filter
///
/// Messages released by one filter flow through every filter after it.
#[derive(Default, Clone)]
pub struct MessageFilterCollection {
    filters: Vec<Arc<dyn MessageFilter>>,
}

impl MessageFilterCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a filter ahead of every other one
    pub fn add_first(&mut self, filter: Arc<dyn MessageFilter>) {
        self.filters.insert(0, filter);
    }

    pub fn add_last(&mut self, filter: Arc<dyn MessageFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    fn run_from(
        &self,
        start: usize,
        messages: Vec<CurrentMessageInformation>,
        now: Instant,
        outcome: &mut FilterOutcome,
    ) {
        let mut current = messages;
        for filter in self.filters.iter().skip(start) {
            let mut next = Vec::new();
            for message in current {
                let step = filter.filter(message, now);
                next.extend(step.deliver);
                outcome.discard.extend(step.discard);
            }
            current = next;
        }
        outcome.deliver.extend(current);
    }
}

impl MessageFilter for MessageFilterCollection {
    fn filter(&self, message: CurrentMessageInformation, now: Instant) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        self.run_from(0, vec![message], now, &mut outcome);
        outcome
    }

    fn expire(&self, now: Instant) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        for (index, filter) in self.filters.iter().enumerate() {
            let released = filter.expire(now);
            outcome.discard.extend(released.discard);
            self.run_from(index + 1, released.deliver, now, &mut outcome);
        }
        outcome
    }
}

impl fmt::Debug for MessageFilterCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFilterCollection")
            .field("filters", &self.filters.len())
            .finish()
    }
}
