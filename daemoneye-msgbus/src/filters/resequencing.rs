//! Duplicate suppression and per-producer resequencing
//!
//! Publishers stamp every pub/sub message with their producer id and a
//! sequence number per message type, starting at 1. For each (producer, type)
//! pair this filter remembers the last sequence number it released:
//!
//! - anything at or below it, or already buffered, is a duplicate and is
//!   discarded (acknowledged without dispatch);
//! - the next expected number is released together with every consecutive
//!   number buffered behind it;
//! - anything further ahead is buffered until the gap fills.
//!
//! A gap left open for the gap timeout, or a buffer growing past the pending
//! limit, releases everything buffered in order and skips the missing
//! numbers. Messages without sequence headers pass through untouched.
//!
//! Idle streams are demoted to a watermark holding only the last released
//! number, so a producer that resumes after a long pause continues in order
//! and late redeliveries of numbers it already sent are still discarded.

use super::{FilterOutcome, MessageFilter};
use crate::context::CurrentMessageInformation;
use crate::transport::headers;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Streams idle for this many gap timeouts with nothing buffered become watermarks
const IDLE_EVICTION_FACTOR: u32 = 10;

/// Watermarks untouched for this many gap timeouts are forgotten
const WATERMARK_RETENTION_FACTOR: u32 = 720;

type StreamKey = (String, &'static str);

#[derive(Default)]
struct Streams {
    active: HashMap<StreamKey, StreamState>,
    watermarks: HashMap<StreamKey, Watermark>,
}

impl Streams {
    fn stream(&mut self, key: StreamKey, now: Instant) -> &mut StreamState {
        let watermarks = &mut self.watermarks;
        self.active.entry(key).or_insert_with_key(|key| {
            let last_released = watermarks
                .remove(key)
                .map_or(0, |watermark| watermark.last_released);
            StreamState::new(last_released, now)
        })
    }
}

struct StreamState {
    last_released: u64,
    pending: BTreeMap<u64, CurrentMessageInformation>,
    gap_since: Option<Instant>,
    last_seen: Instant,
}

struct Watermark {
    last_released: u64,
    since: Instant,
}

impl StreamState {
    fn new(last_released: u64, now: Instant) -> Self {
        Self {
            last_released,
            pending: BTreeMap::new(),
            gap_since: None,
            last_seen: now,
        }
    }

    fn release_consecutive(&mut self, released: &mut Vec<CurrentMessageInformation>) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.last_released + 1 {
                break;
            }
            self.last_released += 1;
            released.push(entry.remove());
        }
    }

    fn release_all(&mut self, released: &mut Vec<CurrentMessageInformation>) {
        let pending = std::mem::take(&mut self.pending);
        for (sequence, message) in pending {
            self.last_released = sequence;
            released.push(message);
        }
        self.gap_since = None;
    }
}

/// Suppresses duplicates and restores publish order per producer
pub struct ResequencingDeduplicationFilter {
    streams: Mutex<Streams>,
    gap_timeout: Duration,
    max_pending: usize,
}

impl ResequencingDeduplicationFilter {
    pub fn new(gap_timeout: Duration, max_pending: usize) -> Self {
        Self {
            streams: Mutex::new(Streams::default()),
            gap_timeout,
            max_pending: max_pending.max(1),
        }
    }

    /// Number of (producer, message type) streams being tracked
    pub fn tracked_streams(&self) -> usize {
        self.streams.lock().active.len()
    }

    /// Idle streams remembered only by their last released sequence number
    pub fn watermarks(&self) -> usize {
        self.streams.lock().watermarks.len()
    }

    /// Messages buffered across every stream
    pub fn buffered(&self) -> usize {
        self.streams
            .lock()
            .active
            .values()
            .map(|stream| stream.pending.len())
            .sum()
    }

    fn sequence_of(message: &CurrentMessageInformation) -> Option<(String, u64)> {
        let producer = message.header(headers::PRODUCER_ID)?;
        let sequence = message.header(headers::SEQUENCE)?.parse().ok()?;
        Some((producer.to_string(), sequence))
    }
}

impl MessageFilter for ResequencingDeduplicationFilter {
    fn filter(&self, message: CurrentMessageInformation, now: Instant) -> FilterOutcome {
        let Some((producer, sequence)) = Self::sequence_of(&message) else {
            return FilterOutcome::deliver(message);
        };

        let mut streams = self.streams.lock();
        let stream = streams.stream((producer, message.message_type.name()), now);
        stream.last_seen = now;

        if sequence <= stream.last_released || stream.pending.contains_key(&sequence) {
            debug!(
                message_type = %message.message_type,
                sequence,
                last_released = stream.last_released,
                "Discarding duplicate message"
            );
            return FilterOutcome::discard(message);
        }

        let mut released = Vec::new();
        if sequence == stream.last_released + 1 {
            stream.last_released = sequence;
            released.push(message);
            stream.release_consecutive(&mut released);
            stream.gap_since = (!stream.pending.is_empty()).then_some(now);
        } else {
            debug!(
                message_type = %message.message_type,
                sequence,
                expected = stream.last_released + 1,
                "Buffering out of order message"
            );
            stream.pending.insert(sequence, message);
            stream.gap_since.get_or_insert(now);

            if stream.pending.len() > self.max_pending {
                warn!(
                    buffered = stream.pending.len(),
                    skipped_after = stream.last_released,
                    "Resequencing buffer full, releasing past the gap"
                );
                stream.release_all(&mut released);
            }
        }

        FilterOutcome {
            deliver: released,
            discard: Vec::new(),
        }
    }

    fn expire(&self, now: Instant) -> FilterOutcome {
        let mut released = Vec::new();
        let mut streams = self.streams.lock();
        let Streams {
            active,
            watermarks,
        } = &mut *streams;

        for ((producer, message_type), stream) in active.iter_mut() {
            if let Some(since) = stream.gap_since
                && now.duration_since(since) >= self.gap_timeout
            {
                warn!(
                    producer = %producer,
                    message_type,
                    buffered = stream.pending.len(),
                    skipped_after = stream.last_released,
                    "Sequence gap timed out, releasing buffered messages"
                );
                stream.release_all(&mut released);
            }
        }

        let idle = self.gap_timeout * IDLE_EVICTION_FACTOR;
        active.retain(|key, stream| {
            if !stream.pending.is_empty() || now.duration_since(stream.last_seen) < idle {
                return true;
            }
            watermarks.insert(
                key.clone(),
                Watermark {
                    last_released: stream.last_released,
                    since: stream.last_seen,
                },
            );
            false
        });

        let retention = self.gap_timeout * WATERMARK_RETENTION_FACTOR;
        watermarks.retain(|_, watermark| now.duration_since(watermark.since) < retention);

        FilterOutcome {
            deliver: released,
            discard: Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::BusMessage;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize)]
    struct Tick;

    impl BusMessage for Tick {
        const TYPE_NAME: &'static str = "tests.tick";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Tock;

    impl BusMessage for Tock {
        const TYPE_NAME: &'static str = "tests.tock";
    }

    fn sequenced(producer: &str, sequence: u64) -> CurrentMessageInformation {
        let mut message = CurrentMessageInformation::local(Arc::new(Tick));
        message
            .headers
            .insert(headers::PRODUCER_ID.to_string(), producer.to_string());
        message
            .headers
            .insert(headers::SEQUENCE.to_string(), sequence.to_string());
        message
    }

    fn sequences(messages: &[CurrentMessageInformation]) -> Vec<u64> {
        messages
            .iter()
            .map(|m| m.header(headers::SEQUENCE).unwrap().parse().unwrap())
            .collect()
    }

    fn run(
        filter: &ResequencingDeduplicationFilter,
        producer: &str,
        order: &[u64],
        now: Instant,
    ) -> (Vec<u64>, Vec<u64>) {
        let mut delivered = Vec::new();
        let mut discarded = Vec::new();
        for &sequence in order {
            let outcome = filter.filter(sequenced(producer, sequence), now);
            delivered.extend(sequences(&outcome.deliver));
            discarded.extend(sequences(&outcome.discard));
        }
        (delivered, discarded)
    }

    fn filter() -> ResequencingDeduplicationFilter {
        ResequencingDeduplicationFilter::new(Duration::from_secs(5), 1000)
    }

    #[test]
    fn test_duplicate_is_suppressed() {
        let (delivered, discarded) = run(&filter(), "p1", &[1, 2, 2, 3], Instant::now());
        assert_eq!(delivered, vec![1, 2, 3]);
        assert_eq!(discarded, vec![2]);
    }

    #[test]
    fn test_out_of_order_is_resequenced() {
        let (delivered, discarded) = run(&filter(), "p1", &[2, 1, 3], Instant::now());
        assert_eq!(delivered, vec![1, 2, 3]);
        assert!(discarded.is_empty());
    }

    #[test]
    fn test_buffered_duplicate_is_suppressed() {
        let filter = filter();
        let (delivered, discarded) = run(&filter, "p1", &[3, 3, 1, 2], Instant::now());
        assert_eq!(delivered, vec![1, 2, 3]);
        assert_eq!(discarded, vec![3]);
        assert_eq!(filter.buffered(), 0);
    }

    #[test]
    fn test_producers_do_not_block_each_other() {
        let filter = filter();
        let now = Instant::now();
        let (blocked, _) = run(&filter, "p1", &[2], now);
        let (flowing, _) = run(&filter, "p2", &[1, 2], now);
        assert!(blocked.is_empty());
        assert_eq!(flowing, vec![1, 2]);
        assert_eq!(filter.tracked_streams(), 2);
    }

    #[test]
    fn test_message_types_are_sequenced_independently() {
        let filter = filter();
        let now = Instant::now();
        let mut tock = CurrentMessageInformation::local(Arc::new(Tock));
        tock.headers
            .insert(headers::PRODUCER_ID.to_string(), "p1".to_string());
        tock.headers
            .insert(headers::SEQUENCE.to_string(), "1".to_string());

        let (ticks, _) = run(&filter, "p1", &[1], now);
        assert_eq!(ticks, vec![1]);
        assert_eq!(filter.filter(tock, now).deliver.len(), 1);
    }

    #[test]
    fn test_unsequenced_messages_pass_through() {
        let filter = filter();
        let message = CurrentMessageInformation::local(Arc::new(Tick));
        let outcome = filter.filter(message, Instant::now());
        assert_eq!(outcome.deliver.len(), 1);
        assert_eq!(filter.tracked_streams(), 0);
    }

    #[test]
    fn test_gap_timeout_skips_missing_numbers() {
        let filter = filter();
        let start = Instant::now();
        let (delivered, _) = run(&filter, "p1", &[1, 3, 4], start);
        assert_eq!(delivered, vec![1]);

        assert!(filter.expire(start + Duration::from_secs(4)).deliver.is_empty());
        let released = filter.expire(start + Duration::from_secs(5));
        assert_eq!(sequences(&released.deliver), vec![3, 4]);

        let (late, discarded) = run(&filter, "p1", &[2, 5], start + Duration::from_secs(6));
        assert_eq!(late, vec![5]);
        assert_eq!(discarded, vec![2]);
    }

    #[test]
    fn test_full_buffer_forces_release() {
        let filter = ResequencingDeduplicationFilter::new(Duration::from_secs(5), 2);
        let (delivered, _) = run(&filter, "p1", &[2, 3, 4], Instant::now());
        assert_eq!(delivered, vec![2, 3, 4]);
        assert_eq!(filter.buffered(), 0);
    }

    #[test]
    fn test_idle_streams_become_watermarks() {
        let filter = filter();
        let start = Instant::now();
        run(&filter, "p1", &[1], start);
        filter.expire(start + Duration::from_secs(49));
        assert_eq!(filter.tracked_streams(), 1);
        filter.expire(start + Duration::from_secs(50));
        assert_eq!(filter.tracked_streams(), 0);
        assert_eq!(filter.watermarks(), 1);

        filter.expire(start + Duration::from_secs(5 * 720));
        assert_eq!(filter.watermarks(), 0);
    }

    #[test]
    fn test_resumed_stream_continues_from_its_watermark() {
        let filter = filter();
        let start = Instant::now();
        run(&filter, "p1", &[1], start);
        filter.expire(start + Duration::from_secs(55));
        assert_eq!(filter.tracked_streams(), 0);

        let resumed = start + Duration::from_secs(60);
        let (next, _) = run(&filter, "p1", &[2], resumed);
        assert_eq!(next, vec![2]);
        assert_eq!(filter.watermarks(), 0);

        let (late, discarded) = run(&filter, "p1", &[1, 2], resumed);
        assert!(late.is_empty());
        assert_eq!(discarded, vec![1, 2]);
        assert_eq!(filter.buffered(), 0);
    }

    proptest! {
        #[test]
        fn prop_any_arrival_order_is_delivered_in_order_once(
            order in Just((1..=30u64).collect::<Vec<_>>()).prop_shuffle(),
            duplicates in proptest::collection::vec(1..=30u64, 0..10),
        ) {
            let filter = filter();
            let mut arrivals = order.clone();
            for (i, dup) in duplicates.iter().enumerate() {
                let at = (i * 3).min(arrivals.len());
                arrivals.insert(at, *dup);
            }

            let (delivered, discarded) = run(&filter, "p1", &arrivals, Instant::now());
            prop_assert_eq!(delivered, (1..=30u64).collect::<Vec<_>>());
            prop_assert_eq!(discarded.len(), duplicates.len());
            prop_assert_eq!(filter.buffered(), 0);
        }

        #[test]
        fn prop_released_sequences_are_strictly_increasing(
            arrivals in proptest::collection::vec(1..=50u64, 1..80),
            max_pending in 1usize..8,
        ) {
            let filter = ResequencingDeduplicationFilter::new(Duration::from_secs(5), max_pending);
            let start = Instant::now();
            let (mut delivered, _) = run(&filter, "p1", &arrivals, start);
            delivered.extend(sequences(&filter.expire(start + Duration::from_secs(5)).deliver));

            prop_assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));
            prop_assert_eq!(filter.buffered(), 0);
        }
    }
}
