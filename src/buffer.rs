//! Fixed-capacity, time-ordered ring of packets for one channel.
//!
//! Packets are kept sorted by start time. The common case, a packet newer than
//! everything retained, lands at the tail in O(1); late packets are placed by binary
//! search. When the ring is full the packet with the smallest start time is evicted.
//!
//! # Ordering rules
//!
//! - A packet whose start time equals a retained packet's start time replaces it.
//! - A packet older than the oldest retained packet is inserted while the ring has
//!   room, and dropped once it is full (it would be evicted immediately).
//!
//! Each stored packet is stamped with its arrival order, so callers that merge
//! overlapping packets can let the most recently received one win
//! (see [`CircularBuffer::query_by_arrival`]).
//!
//! # Thread Safety
//!
//! All state sits behind one `parking_lot::Mutex`. Queries clone `Arc` handles while
//! holding the lock, so readers never observe a partially written packet and never
//! hold the lock while the caller processes the result.

use crate::error::{AppResult, CacheError};
use crate::packet::{ChannelId, Packet, Sample};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// What [`CircularBuffer::append`] did with a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome<T: Sample> {
    /// Stored; the ring grew by one.
    Inserted,
    /// Stored in place of a packet with the same start time.
    Replaced,
    /// Stored; the oldest packet was evicted to make room.
    InsertedWithEviction(Arc<Packet<T>>),
    /// Not stored: the ring is full and the packet is older than everything in it.
    Dropped(Arc<Packet<T>>),
}

impl<T: Sample> AppendOutcome<T> {
    /// Change in the number of retained packets.
    pub fn size_delta(&self) -> isize {
        match self {
            AppendOutcome::Inserted => 1,
            _ => 0,
        }
    }

    /// True unless the packet was dropped.
    pub fn is_stored(&self) -> bool {
        !matches!(self, AppendOutcome::Dropped(_))
    }
}

#[derive(Debug)]
struct Entry<T: Sample> {
    arrival: u64,
    packet: Arc<Packet<T>>,
}

#[derive(Debug)]
struct BufferState<T: Sample> {
    channel: Option<ChannelId>,
    capacity: usize,
    next_arrival: u64,
    packets: VecDeque<Entry<T>>,
}

impl<T: Sample> BufferState<T> {
    fn check_packet(&self, packet: &Packet<T>) -> AppResult<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or(CacheError::NotInitialized("circular buffer"))?;
        packet.validate()?;
        if packet.channel() != channel {
            return Err(CacheError::ChannelMismatch {
                packet: packet.channel().to_string(),
                buffer: channel.to_string(),
            });
        }
        Ok(())
    }

    /// Index of the first packet whose start time is not less than `start_time`.
    fn lower_bound(&self, start_time: i64) -> usize {
        self.packets.partition_point(|e| e.packet.start_time() < start_time)
    }

    fn is_full(&self) -> bool {
        self.packets.len() >= self.capacity
    }

    /// True when storing a packet starting at `start_time` would grow the ring.
    fn grows(&self, start_time: i64) -> bool {
        if self.is_full() {
            return false;
        }
        let index = self.lower_bound(start_time);
        !matches!(self.packets.get(index), Some(e) if e.packet.start_time() == start_time)
    }

    fn insert(&mut self, packet: Arc<Packet<T>>) -> AppendOutcome<T> {
        let start_time = packet.start_time();

        // Fast path: strictly newer than the tail.
        if self
            .packets
            .back()
            .map_or(true, |last| last.packet.start_time() < start_time)
        {
            let tail = self.packets.len();
            return self.push_with_eviction(tail, packet);
        }

        let index = self.lower_bound(start_time);
        let arrival = self.next_arrival;
        if let Some(existing) = self.packets.get_mut(index) {
            if existing.packet.start_time() == start_time {
                *existing = Entry { arrival, packet };
                self.next_arrival += 1;
                return AppendOutcome::Replaced;
            }
        }
        if index == 0 && self.is_full() {
            return AppendOutcome::Dropped(packet);
        }
        self.push_with_eviction(index, packet)
    }

    fn push_with_eviction(&mut self, index: usize, packet: Arc<Packet<T>>) -> AppendOutcome<T> {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.packets.insert(index, Entry { arrival, packet });
        if self.packets.len() > self.capacity {
            if let Some(evicted) = self.packets.pop_front() {
                return AppendOutcome::InsertedWithEviction(evicted.packet);
            }
        }
        AppendOutcome::Inserted
    }
}

/// Time-ordered ring of packets for one channel.
#[derive(Debug)]
pub struct CircularBuffer<T: Sample> {
    state: Mutex<BufferState<T>>,
}

impl<T: Sample> Default for CircularBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Sample> CircularBuffer<T> {
    /// Creates an uninitialized buffer; call [`CircularBuffer::initialize`] before use.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferState {
                channel: None,
                capacity: 0,
                next_arrival: 0,
                packets: VecDeque::new(),
            }),
        }
    }

    /// Creates and initializes a buffer in one step.
    pub fn with_capacity(channel: ChannelId, capacity: usize) -> AppResult<Self> {
        let buffer = Self::new();
        buffer.initialize(channel, capacity)?;
        Ok(buffer)
    }

    /// Binds the buffer to a channel and capacity, discarding any retained packets.
    pub fn initialize(&self, channel: ChannelId, capacity: usize) -> AppResult<()> {
        if capacity == 0 {
            return Err(CacheError::InvalidCapacity(format!(
                "buffer for {channel} must hold at least one packet"
            )));
        }
        let mut state = self.state.lock();
        state.channel = Some(channel);
        state.capacity = capacity;
        state.packets = VecDeque::with_capacity(capacity);
        Ok(())
    }

    /// True once [`CircularBuffer::initialize`] has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().channel.is_some()
    }

    /// Channel this buffer was initialized for.
    pub fn channel(&self) -> Option<ChannelId> {
        self.state.lock().channel.clone()
    }

    /// Stores a packet, keeping start-time order and the capacity bound.
    pub fn append(&self, packet: impl Into<Arc<Packet<T>>>) -> AppResult<AppendOutcome<T>> {
        let packet = packet.into();
        let mut state = self.state.lock();
        state.check_packet(&packet)?;
        Ok(state.insert(packet))
    }

    /// Stores a packet only if doing so cannot grow the ring.
    ///
    /// Replacements, inserts into a full ring and drops happen here; a packet that
    /// would increase [`CircularBuffer::size`] is handed back untouched.
    pub fn append_without_growth(
        &self,
        packet: Arc<Packet<T>>,
    ) -> AppResult<Result<AppendOutcome<T>, Arc<Packet<T>>>> {
        let mut state = self.state.lock();
        state.check_packet(&packet)?;
        if state.grows(packet.start_time()) {
            return Ok(Err(packet));
        }
        Ok(Ok(state.insert(packet)))
    }

    /// Packets intersecting `[start, end]` (inclusive), in ascending start order.
    pub fn query(&self, start: i64, end: i64) -> AppResult<Vec<Arc<Packet<T>>>> {
        Ok(self
            .window_entries(start, end)?
            .into_iter()
            .map(|(_, packet)| packet)
            .collect())
    }

    /// Packets intersecting `[start, end]` (inclusive), oldest arrival first.
    ///
    /// Where packets overlap, the last one in the result is the most recently
    /// received.
    pub fn query_by_arrival(&self, start: i64, end: i64) -> AppResult<Vec<Arc<Packet<T>>>> {
        let mut entries = self.window_entries(start, end)?;
        entries.sort_unstable_by_key(|(arrival, _)| *arrival);
        Ok(entries.into_iter().map(|(_, packet)| packet).collect())
    }

    fn window_entries(&self, start: i64, end: i64) -> AppResult<Vec<(u64, Arc<Packet<T>>)>> {
        if start > end {
            return Err(CacheError::InvalidTimeWindow { start, end });
        }
        let state = self.state.lock();
        if state.channel.is_none() {
            return Err(CacheError::NotInitialized("circular buffer"));
        }
        Ok(state
            .packets
            .iter()
            .take_while(|e| e.packet.start_time() <= end)
            .filter(|e| e.packet.end_time() >= start)
            .map(|e| (e.arrival, Arc::clone(&e.packet)))
            .collect())
    }

    /// Packets ending at or after `start`.
    pub fn query_since(&self, start: i64) -> AppResult<Vec<Arc<Packet<T>>>> {
        self.query(start, i64::MAX)
    }

    /// Every retained packet in ascending start order.
    pub fn packets(&self) -> AppResult<Vec<Arc<Packet<T>>>> {
        let state = self.state.lock();
        if state.channel.is_none() {
            return Err(CacheError::NotInitialized("circular buffer"));
        }
        Ok(state.packets.iter().map(|e| Arc::clone(&e.packet)).collect())
    }

    /// Start time of the oldest retained packet.
    pub fn earliest_start_time(&self) -> Option<i64> {
        self.state.lock().packets.front().map(|e| e.packet.start_time())
    }

    /// End time of the newest retained packet.
    pub fn latest_end_time(&self) -> Option<i64> {
        self.state.lock().packets.back().map(|e| e.packet.end_time())
    }

    /// Removes and returns the oldest retained packet.
    pub fn pop_oldest(&self) -> Option<Arc<Packet<T>>> {
        self.state.lock().packets.pop_front().map(|e| e.packet)
    }

    /// Drops every retained packet; the binding to channel and capacity survives.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.packets.len();
        state.packets.clear();
        removed
    }

    /// Number of retained packets.
    pub fn size(&self) -> usize {
        self.state.lock().packets.len()
    }

    /// Maximum number of retained packets (zero before initialization).
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// True when the next new packet will evict the oldest one.
    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.channel.is_some() && state.is_full()
    }

    /// True when no packets are retained.
    pub fn is_empty(&self) -> bool {
        self.state.lock().packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn channel() -> ChannelId {
        ChannelId::new("UU", "FORK", "HHZ", "01").unwrap()
    }

    /// One-second packet of ten samples at 10 Hz starting at `second`.
    fn packet(second: i64) -> Packet<i32> {
        Packet::new(channel(), second * 1_000_000, 10.0, vec![second as i32; 10]).unwrap()
    }

    fn starts(buffer: &CircularBuffer<i32>) -> Vec<i64> {
        buffer
            .packets()
            .unwrap()
            .iter()
            .map(|p| p.start_time() / 1_000_000)
            .collect()
    }

    #[test]
    fn test_uninitialized_buffer_rejects_use() {
        let buffer = CircularBuffer::<i32>::new();
        assert!(!buffer.is_initialized());
        assert!(matches!(
            buffer.append(packet(0)),
            Err(CacheError::NotInitialized(_))
        ));
        assert!(buffer.query(0, 1).is_err());
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let buffer = CircularBuffer::<i32>::new();
        assert!(matches!(
            buffer.initialize(channel(), 0),
            Err(CacheError::InvalidCapacity(_))
        ));
    }

    #[test]
    fn test_wrong_channel_is_rejected() {
        let buffer = CircularBuffer::with_capacity(channel(), 4).unwrap();
        let other = ChannelId::new("UU", "FORK", "HHN", "01").unwrap();
        let packet = Packet::new(other, 0, 10.0, vec![0i32; 3]).unwrap();
        assert!(matches!(
            buffer.append(packet),
            Err(CacheError::ChannelMismatch { .. })
        ));
    }

    #[test]
    fn test_append_evicts_oldest_when_full() {
        let buffer = CircularBuffer::with_capacity(channel(), 3).unwrap();
        for second in 0..3 {
            assert_eq!(buffer.append(packet(second)).unwrap(), AppendOutcome::Inserted);
        }
        assert!(buffer.is_full());
        match buffer.append(packet(3)).unwrap() {
            AppendOutcome::InsertedWithEviction(evicted) => {
                assert_eq!(evicted.start_time(), 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(starts(&buffer), vec![1, 2, 3]);
    }

    #[test]
    fn test_out_of_order_packets_are_sorted() {
        let buffer = CircularBuffer::with_capacity(channel(), 5).unwrap();
        for second in [3, 1, 4, 0, 2] {
            buffer.append(packet(second)).unwrap();
        }
        assert_eq!(starts(&buffer), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_duplicate_start_replaces() {
        let buffer = CircularBuffer::with_capacity(channel(), 3).unwrap();
        buffer.append(packet(1)).unwrap();
        let newer = Packet::new(channel(), 1_000_000, 10.0, vec![99i32; 10]).unwrap();
        assert_eq!(buffer.append(newer).unwrap(), AppendOutcome::Replaced);
        assert_eq!(buffer.size(), 1);
        assert_eq!(buffer.packets().unwrap()[0].samples()[0], 99);
    }

    #[test]
    fn test_stale_packet_dropped_only_when_full() {
        let buffer = CircularBuffer::with_capacity(channel(), 2).unwrap();
        buffer.append(packet(5)).unwrap();
        assert_eq!(buffer.append(packet(1)).unwrap(), AppendOutcome::Inserted);
        assert!(matches!(
            buffer.append(packet(0)).unwrap(),
            AppendOutcome::Dropped(_)
        ));
        assert_eq!(starts(&buffer), vec![1, 5]);
    }

    #[test]
    fn test_late_packet_in_full_buffer_evicts_oldest() {
        let buffer = CircularBuffer::with_capacity(channel(), 3).unwrap();
        for second in [0, 2, 4] {
            buffer.append(packet(second)).unwrap();
        }
        assert!(matches!(
            buffer.append(packet(3)).unwrap(),
            AppendOutcome::InsertedWithEviction(_)
        ));
        assert_eq!(starts(&buffer), vec![2, 3, 4]);
    }

    #[test]
    fn test_query_is_inclusive() {
        let buffer = CircularBuffer::with_capacity(channel(), 10).unwrap();
        for second in 0..5 {
            buffer.append(packet(second)).unwrap();
        }
        // Packet 1 spans [1.0 s, 1.9 s]; a window ending at 2.0 s includes packet 2.
        let hits = buffer.query(1_900_000, 2_000_000).unwrap();
        let hit_starts: Vec<i64> = hits.iter().map(|p| p.start_time()).collect();
        assert_eq!(hit_starts, vec![1_000_000, 2_000_000]);

        assert!(buffer.query(10_000_000, 20_000_000).unwrap().is_empty());
        assert_eq!(buffer.query_since(3_950_000).unwrap().len(), 1);
        assert!(matches!(
            buffer.query(2, 1),
            Err(CacheError::InvalidTimeWindow { start: 2, end: 1 })
        ));
    }

    #[test]
    fn test_query_by_arrival_puts_latest_last() {
        let buffer = CircularBuffer::with_capacity(channel(), 10).unwrap();
        buffer.append(packet(5)).unwrap();
        // Ten seconds at 10 Hz, overlapping packet 5 completely.
        let wide = Packet::new(channel(), 0, 10.0, vec![-1; 100]).unwrap();
        buffer.append(wide).unwrap();

        let by_start: Vec<i64> = buffer
            .query(0, 9_000_000)
            .unwrap()
            .iter()
            .map(|p| p.start_time())
            .collect();
        assert_eq!(by_start, vec![0, 5_000_000]);

        let by_arrival: Vec<i64> = buffer
            .query_by_arrival(0, 9_000_000)
            .unwrap()
            .iter()
            .map(|p| p.start_time())
            .collect();
        assert_eq!(by_arrival, vec![5_000_000, 0]);

        // A replacement counts as a new arrival.
        buffer.append(packet(5)).unwrap();
        let latest = buffer.query_by_arrival(0, 9_000_000).unwrap();
        assert_eq!(latest.last().unwrap().start_time(), 5_000_000);
    }

    #[test]
    fn test_append_without_growth() {
        let buffer = CircularBuffer::with_capacity(channel(), 2).unwrap();
        let fresh = Arc::new(packet(0));
        assert!(buffer.append_without_growth(fresh).unwrap().is_err());
        buffer.append(packet(0)).unwrap();
        assert_eq!(
            buffer
                .append_without_growth(Arc::new(packet(0)))
                .unwrap()
                .unwrap(),
            AppendOutcome::Replaced
        );
        buffer.append(packet(1)).unwrap();
        assert!(matches!(
            buffer.append_without_growth(Arc::new(packet(2))).unwrap(),
            Ok(AppendOutcome::InsertedWithEviction(_))
        ));
    }

    #[test]
    fn test_pop_and_clear() {
        let buffer = CircularBuffer::with_capacity(channel(), 4).unwrap();
        for second in 0..3 {
            buffer.append(packet(second)).unwrap();
        }
        assert_eq!(buffer.earliest_start_time(), Some(0));
        assert_eq!(buffer.latest_end_time(), Some(2_900_000));
        assert_eq!(buffer.pop_oldest().unwrap().start_time(), 0);
        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
        assert!(buffer.is_initialized());
    }

    #[test]
    fn test_concurrent_append_and_query() {
        let buffer = Arc::new(CircularBuffer::with_capacity(channel(), 50).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..100 {
                        buffer.append(packet(i * 4 + w)).unwrap();
                    }
                })
            })
            .collect();
        let reader = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for _ in 0..200 {
                    let packets = buffer.query(0, i64::MAX).unwrap();
                    assert!(packets.len() <= 50);
                    assert!(packets
                        .windows(2)
                        .all(|w| w[0].start_time() < w[1].start_time()));
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(buffer.size(), 50);
    }
}
