//! # Packet Cache Library
//!
//! This crate implements an in-memory cache of seismic waveform packets and the
//! gap-tolerant retrieval engine that turns those packets back into continuous,
//! uniformly sampled waveforms. Incoming packets are held per channel in bounded,
//! time-ordered buffers under a global capacity cap; queries by time window are
//! answered with interpolated waveforms whose unrecoverable samples are explicitly
//! marked as gaps.
//!
//! ## Crate Structure
//!
//! The library is organized into several modules, each with a distinct responsibility:
//!
//! - **`packet`**: `ChannelId`, the generic `Packet<T>` and microsecond time helpers.
//! - **`buffer`**: `CircularBuffer`, the fixed-capacity, time-ordered ring for one channel.
//! - **`collection`**: `CappedCollection`, the thread-safe registry of buffers that
//!   enforces per-channel and total capacity.
//! - **`pattern`**: glob-pattern blacklists of channel codes.
//! - **`interpolate`**: `WigginsInterpolator`, which merges packets and evaluates them on
//!   a uniform grid with gap marking.
//! - **`waveform`**: single- and three-component waveform types.
//! - **`messages`**: request/response types and `ReturnCode`.
//! - **`codec`**: JSON and binary envelopes for messages.
//! - **`transport`**: the in-process request channel between requestors and the service.
//! - **`service`**: `CacheService`, which owns the collection, ingests packets and answers
//!   queries on a worker pool.
//! - **`requestor`**: `Requestor`, the blocking client with a timeout.
//! - **`config`**: Figment-based configuration loading and validation.
//! - **`telemetry`**: `tracing` subscriber setup.
//! - **`error`**: the crate-wide `CacheError` enum.

pub mod buffer;
pub mod codec;
pub mod collection;
pub mod config;
pub mod error;
pub mod interpolate;
pub mod messages;
pub mod packet;
pub mod pattern;
pub mod requestor;
pub mod service;
pub mod telemetry;
pub mod transport;
pub mod waveform;

pub use buffer::{AppendOutcome, CircularBuffer};
pub use collection::{AddOutcome, CappedCollection, CollectionSettings};
pub use error::{AppResult, CacheError};
pub use interpolate::WigginsInterpolator;
pub use messages::ReturnCode;
pub use packet::{ChannelId, Packet, Sample};
pub use requestor::{Requestor, RequestorOptions};
pub use service::{CacheService, ServiceOptions, ServiceState};
pub use waveform::{SingleComponentWaveform, ThreeComponentWaveform};
