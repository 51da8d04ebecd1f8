//! Registry of per-channel circular buffers under a global packet cap.
//!
//! [`CappedCollection`] routes each packet to the buffer for its channel, creating
//! buffers on first sight. Two limits apply:
//!
//! - **Per channel**: each buffer holds at most `max_packets_per_channel` packets and
//!   evicts its own oldest packet when full.
//! - **Total**: the sum of all buffer sizes never exceeds `max_total_packets`. Before
//!   an insert that would grow the collection past the cap, the globally oldest packet
//!   (smallest start time across channels) is evicted.
//!
//! # Locking
//!
//! The channel map sits behind a `parking_lot::RwLock` that is write-locked only to
//! create a buffer. Inserts that cannot grow the collection (replacements, inserts
//! into a full buffer, drops) run under the buffer's own mutex alone. Inserts that
//! grow it are serialized by an admission mutex, held for the eviction decision and
//! the insert. Buffer locks are always taken after, never while holding, another
//! buffer lock.

use crate::buffer::{AppendOutcome, CircularBuffer};
use crate::error::{AppResult, CacheError};
use crate::packet::{format_timestamp, ChannelId, Packet, Sample};
use crate::pattern::Blacklist;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Limits and filters applied by a [`CappedCollection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSettings {
    /// Capacity of each channel's circular buffer.
    pub max_packets_per_channel: usize,
    /// Cap on the number of packets across all channels.
    pub max_total_packets: usize,
    /// Channel codes whose packets are discarded on arrival.
    pub blacklist: Blacklist,
}

impl CollectionSettings {
    /// Settings without a blacklist.
    pub fn new(max_packets_per_channel: usize, max_total_packets: usize) -> Self {
        Self {
            max_packets_per_channel,
            max_total_packets,
            blacklist: Blacklist::default(),
        }
    }

    /// Adds channel-code patterns to discard.
    pub fn with_blacklist(mut self, blacklist: Blacklist) -> Self {
        self.blacklist = blacklist;
        self
    }
}

/// What [`CappedCollection::add_packet`] did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored; `evicted` older packets were removed to respect the capacity limits.
    Stored {
        /// Packets evicted from this or other channels
        evicted: usize,
    },
    /// Stored in place of a packet with the same start time.
    Replaced,
    /// Discarded because its channel code is blacklisted.
    Blacklisted,
    /// Discarded because it is older than everything it would compete with.
    Dropped,
}

impl AddOutcome {
    /// Number of packets evicted to admit this one.
    pub fn evicted(&self) -> usize {
        match self {
            AddOutcome::Stored { evicted } => *evicted,
            _ => 0,
        }
    }

    /// True when the packet is now retained.
    pub fn is_stored(&self) -> bool {
        matches!(self, AddOutcome::Stored { .. } | AddOutcome::Replaced)
    }
}

/// Map from channel to circular buffer with global capacity enforcement.
#[derive(Debug)]
pub struct CappedCollection<T: Sample> {
    settings: Option<CollectionSettings>,
    buffers: RwLock<HashMap<ChannelId, Arc<CircularBuffer<T>>>>,
    total: AtomicUsize,
    admission: Mutex<()>,
}

impl<T: Sample> Default for CappedCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Sample> CappedCollection<T> {
    /// Creates an uninitialized collection.
    pub fn new() -> Self {
        Self {
            settings: None,
            buffers: RwLock::new(HashMap::new()),
            total: AtomicUsize::new(0),
            admission: Mutex::new(()),
        }
    }

    /// Creates and initializes a collection in one step.
    pub fn with_settings(settings: CollectionSettings) -> AppResult<Self> {
        let mut collection = Self::new();
        collection.initialize(settings)?;
        Ok(collection)
    }

    /// Applies limits and clears any retained packets.
    pub fn initialize(&mut self, settings: CollectionSettings) -> AppResult<()> {
        if settings.max_packets_per_channel == 0 {
            return Err(CacheError::InvalidCapacity(
                "max_packets_per_channel must be at least 1".into(),
            ));
        }
        if settings.max_total_packets == 0 {
            return Err(CacheError::InvalidCapacity(
                "max_total_packets must be at least 1".into(),
            ));
        }
        debug!(
            per_channel = settings.max_packets_per_channel,
            total = settings.max_total_packets,
            blacklist = ?settings.blacklist.patterns(),
            "Initializing capped collection"
        );
        self.buffers.get_mut().clear();
        *self.total.get_mut() = 0;
        self.settings = Some(settings);
        Ok(())
    }

    /// True once [`CappedCollection::initialize`] has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.settings.is_some()
    }

    /// Active limits.
    pub fn settings(&self) -> AppResult<&CollectionSettings> {
        self.settings
            .as_ref()
            .ok_or(CacheError::NotInitialized("capped collection"))
    }

    /// Routes a packet to its channel's buffer, evicting as needed.
    ///
    /// A packet is [`AddOutcome::Dropped`] in two cases:
    ///
    /// - its own buffer is full and it is older than every packet in it;
    /// - the collection is at `max_total_packets` and it is older than every packet
    ///   in every channel, so admitting it would only evict it again.
    ///
    /// Both cases are logged at `warn` level.
    pub fn add_packet(&self, packet: impl Into<Arc<Packet<T>>>) -> AppResult<AddOutcome> {
        let settings = self.settings()?;
        let packet = packet.into();
        packet.validate()?;

        if settings.blacklist.matches(packet.channel().channel()) {
            trace!(channel = %packet.channel(), "Discarding blacklisted packet");
            return Ok(AddOutcome::Blacklisted);
        }

        let buffer = self.buffer_for(packet.channel(), settings.max_packets_per_channel)?;
        let packet = match buffer.append_without_growth(packet)? {
            Ok(outcome) => return Ok(Self::report(outcome, 0)),
            Err(packet) => packet,
        };

        let _admission = self.admission.lock();
        // Another producer may have filled the buffer or stored this start time meanwhile.
        let packet = match buffer.append_without_growth(packet)? {
            Ok(outcome) => return Ok(Self::report(outcome, 0)),
            Err(packet) => packet,
        };

        let mut evicted = 0;
        while self.total.load(Ordering::Acquire) >= settings.max_total_packets {
            let Some((victim, oldest)) = self.oldest_buffer() else {
                break;
            };
            if packet.start_time() < oldest {
                warn!(
                    channel = %packet.channel(),
                    start_time = %format_timestamp(packet.start_time()),
                    "Dropping packet older than all retained packets at total capacity"
                );
                return Ok(AddOutcome::Dropped);
            }
            if victim.pop_oldest().is_some() {
                self.total.fetch_sub(1, Ordering::AcqRel);
                evicted += 1;
            }
        }

        let outcome = buffer.append(packet)?;
        if outcome.size_delta() > 0 {
            self.total.fetch_add(1, Ordering::AcqRel);
        }
        Ok(Self::report(outcome, evicted))
    }

    fn report(outcome: AppendOutcome<T>, evicted: usize) -> AddOutcome {
        match outcome {
            AppendOutcome::Inserted => AddOutcome::Stored { evicted },
            AppendOutcome::InsertedWithEviction(_) => AddOutcome::Stored {
                evicted: evicted + 1,
            },
            AppendOutcome::Replaced => AddOutcome::Replaced,
            AppendOutcome::Dropped(packet) => {
                warn!(
                    channel = %packet.channel(),
                    start_time = %format_timestamp(packet.start_time()),
                    "Dropping packet older than everything in its full buffer"
                );
                AddOutcome::Dropped
            }
        }
    }

    fn buffer_for(
        &self,
        channel: &ChannelId,
        capacity: usize,
    ) -> AppResult<Arc<CircularBuffer<T>>> {
        if let Some(buffer) = self.buffers.read().get(channel) {
            return Ok(Arc::clone(buffer));
        }
        let mut buffers = self.buffers.write();
        if let Some(buffer) = buffers.get(channel) {
            return Ok(Arc::clone(buffer));
        }
        let buffer = Arc::new(CircularBuffer::with_capacity(channel.clone(), capacity)?);
        debug!(channel = %channel, capacity, "Created circular buffer");
        buffers.insert(channel.clone(), Arc::clone(&buffer));
        Ok(buffer)
    }

    fn existing_buffer(&self, channel: &ChannelId) -> Option<Arc<CircularBuffer<T>>> {
        self.buffers.read().get(channel).cloned()
    }

    /// Buffer holding the globally oldest packet, with that packet's start time.
    fn oldest_buffer(&self) -> Option<(Arc<CircularBuffer<T>>, i64)> {
        let buffers = self.buffers.read();
        buffers
            .values()
            .filter_map(|b| b.earliest_start_time().map(|t| (b, t)))
            .min_by_key(|(_, t)| *t)
            .map(|(b, t)| (Arc::clone(b), t))
    }

    /// True when the channel has at least one retained packet.
    pub fn have_sensor(&self, channel: &ChannelId) -> bool {
        self.existing_buffer(channel)
            .is_some_and(|buffer| !buffer.is_empty())
    }

    /// Channels with retained packets, sorted.
    pub fn sensors(&self) -> Vec<ChannelId> {
        let mut sensors: Vec<ChannelId> = self
            .buffers
            .read()
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(channel, _)| channel.clone())
            .collect();
        sensors.sort();
        sensors
    }

    /// Packets of one channel intersecting `[start, end]`; empty for unknown channels.
    pub fn packets(
        &self,
        channel: &ChannelId,
        start: i64,
        end: i64,
    ) -> AppResult<Vec<Arc<Packet<T>>>> {
        self.settings()?;
        if start > end {
            return Err(CacheError::InvalidTimeWindow { start, end });
        }
        match self.existing_buffer(channel) {
            Some(buffer) => buffer.query(start, end),
            None => Ok(Vec::new()),
        }
    }

    /// Like [`CappedCollection::packets`], ordered oldest arrival first.
    ///
    /// Where packets overlap, the most recently received one comes last.
    pub fn packets_by_arrival(
        &self,
        channel: &ChannelId,
        start: i64,
        end: i64,
    ) -> AppResult<Vec<Arc<Packet<T>>>> {
        self.settings()?;
        if start > end {
            return Err(CacheError::InvalidTimeWindow { start, end });
        }
        match self.existing_buffer(channel) {
            Some(buffer) => buffer.query_by_arrival(start, end),
            None => Ok(Vec::new()),
        }
    }

    /// Packets of one channel ending at or after `start`.
    pub fn packets_since(&self, channel: &ChannelId, start: i64) -> AppResult<Vec<Arc<Packet<T>>>> {
        self.packets(channel, start, i64::MAX)
    }

    /// Every retained packet of one channel.
    pub fn all_packets(&self, channel: &ChannelId) -> AppResult<Vec<Arc<Packet<T>>>> {
        self.settings()?;
        match self.existing_buffer(channel) {
            Some(buffer) => buffer.packets(),
            None => Ok(Vec::new()),
        }
    }

    /// Packets for several channels; channels without data are omitted.
    pub fn query(
        &self,
        channels: &[ChannelId],
        start: i64,
        end: i64,
    ) -> AppResult<HashMap<ChannelId, Vec<Arc<Packet<T>>>>> {
        let mut result = HashMap::with_capacity(channels.len());
        for channel in channels {
            let packets = self.packets(channel, start, end)?;
            if !packets.is_empty() {
                result.insert(channel.clone(), packets);
            }
        }
        Ok(result)
    }

    /// Start time of the oldest retained packet of one channel.
    pub fn earliest_start_time(&self, channel: &ChannelId) -> Option<i64> {
        self.existing_buffer(channel)?.earliest_start_time()
    }

    /// Number of packets across all channels.
    pub fn total_packets(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Number of packets across all channels, counted buffer by buffer.
    ///
    /// Taken under the admission lock, so no insert can grow the collection
    /// mid-count. Agrees with [`CappedCollection::total_packets`] whenever no
    /// insert is in flight.
    pub fn retained_packets(&self) -> usize {
        let _admission = self.admission.lock();
        self.buffers.read().values().map(|buffer| buffer.size()).sum()
    }

    /// Empties every buffer; limits and channel bindings stay in force.
    ///
    /// Buffers stay registered, so a producer already holding one keeps
    /// writing to a buffer the collection still counts.
    pub fn clear(&self) {
        let _admission = self.admission.lock();
        let removed: usize = self.buffers.read().values().map(|buffer| buffer.clear()).sum();
        self.total.fetch_sub(removed, Ordering::AcqRel);
        debug!(removed, "Cleared capped collection");
    }
}
