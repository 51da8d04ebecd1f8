//! The packet cache service: ingestion, query workers and lifecycle.
//!
//! [`CacheService`] owns a [`CappedCollection`] and moves through
//! `Uninitialized -> Initialized -> Running -> Stopped`:
//!
//! - [`CacheService::initialize`] allocates the collection and the bounded packet
//!   and request queues.
//! - [`CacheService::start`] spawns one ingestion thread, which drains the packet
//!   queue into the collection, and a pool of query workers, which answer
//!   envelopes arriving through the [`Endpoint`].
//! - [`CacheService::stop`] closes the endpoint, lets workers finish the request in
//!   hand, answers requests still queued with a [`FailureResponse`] and joins every
//!   thread. A stopped service cannot be restarted.
//!
//! Per-packet and per-request failures are logged and isolated; they never stop the
//! service. The `handle_*` methods answer requests in-process without encoding.

use crate::codec::Envelope;
use crate::collection::{AddOutcome, CappedCollection, CollectionSettings};
use crate::config::CacheConfig;
use crate::error::{AppResult, CacheError};
use crate::interpolate::WigginsInterpolator;
use crate::messages::{
    BulkDataRequest, BulkDataResponse, DataRequest, DataResponse, FailureResponse, Message,
    ReturnCode, SensorRequest, SensorResponse, ThreeComponentDataRequest,
    ThreeComponentDataResponse,
};
use crate::packet::{sampling_period_microseconds, ChannelId, Packet, Sample};
use crate::transport::{request_channel, Endpoint, IncomingRequest, RequestQueue};
use crate::waveform::{check_components, SingleComponentWaveform, ThreeComponentWaveform};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`CacheService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Created; nothing allocated.
    Uninitialized,
    /// Collection and queues allocated; no threads running.
    Initialized,
    /// Ingesting packets and answering requests.
    Running,
    /// Shut down for good.
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ServiceState::Uninitialized => "uninitialized",
            ServiceState::Initialized => "initialized",
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

/// Runtime options for a [`CacheService`].
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceOptions {
    /// Collection limits and blacklist
    pub collection: CollectionSettings,
    /// Holes in coverage up to this long are interpolated across
    pub gap_tolerance: Duration,
    /// Output rate when neither the request nor `channel_sampling_rates` name one
    pub default_sampling_rate: Option<f64>,
    /// Output rate per channel
    pub channel_sampling_rates: HashMap<ChannelId, f64>,
    /// Most output samples a single query may produce
    pub max_query_samples: usize,
    /// Capacity of the bounded packet queue
    pub ingest_queue_capacity: usize,
    /// Capacity of the bounded request queue
    pub request_queue_capacity: usize,
    /// Number of query worker threads
    pub query_workers: usize,
    /// How often idle threads check for shutdown
    pub poll_interval: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        let config = CacheConfig::default();
        Self {
            collection: CollectionSettings::new(
                config.cache.max_packets_per_channel,
                config.cache.max_total_packets,
            ),
            gap_tolerance: config.interpolation.gap_tolerance,
            default_sampling_rate: None,
            channel_sampling_rates: HashMap::new(),
            max_query_samples: config.interpolation.max_query_samples,
            ingest_queue_capacity: config.cache.ingest_queue_capacity,
            request_queue_capacity: config.cache.request_queue_capacity,
            query_workers: config.cache.query_workers,
            poll_interval: Duration::from_millis(20),
        }
    }
}

impl ServiceOptions {
    /// Builds options from a loaded configuration, validating it first.
    pub fn from_config(config: &CacheConfig) -> AppResult<Self> {
        config.validate().map_err(CacheError::Configuration)?;
        let channel_sampling_rates = config
            .interpolation
            .channel_sampling_rates
            .iter()
            .map(|(channel, &rate)| channel.parse::<ChannelId>().map(|id| (id, rate)))
            .collect::<AppResult<HashMap<_, _>>>()?;
        Ok(Self {
            collection: config.collection_settings()?,
            gap_tolerance: config.interpolation.gap_tolerance,
            default_sampling_rate: config.interpolation.default_sampling_rate,
            channel_sampling_rates,
            max_query_samples: config.interpolation.max_query_samples,
            ingest_queue_capacity: config.cache.ingest_queue_capacity,
            request_queue_capacity: config.cache.request_queue_capacity,
            query_workers: config.cache.query_workers,
            ..Self::default()
        })
    }

    /// Configured output rate for a channel, if any.
    pub fn sampling_rate_for(&self, channel: &ChannelId) -> Option<f64> {
        self.channel_sampling_rates
            .get(channel)
            .copied()
            .or(self.default_sampling_rate)
    }

    fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("ingest_queue_capacity", self.ingest_queue_capacity),
            ("request_queue_capacity", self.request_queue_capacity),
            ("query_workers", self.query_workers),
            ("max_query_samples", self.max_query_samples),
        ] {
            if value == 0 {
                return Err(CacheError::Configuration(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

/// State shared between the service handle and its threads.
#[derive(Debug)]
struct Shared<T: Sample> {
    collection: CappedCollection<T>,
    options: ServiceOptions,
    running: AtomicBool,
}

/// In-memory packet cache answering waveform queries.
#[derive(Debug)]
pub struct CacheService<T: Sample> {
    state: ServiceState,
    shared: Option<Arc<Shared<T>>>,
    packet_sender: Option<Sender<Packet<T>>>,
    packet_receiver: Option<Receiver<Packet<T>>>,
    endpoint: Option<Endpoint>,
    queue: Option<RequestQueue>,
    threads: Vec<JoinHandle<()>>,
}

impl<T: Sample> Default for CacheService<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Sample> CacheService<T> {
    /// Creates an uninitialized service.
    pub fn new() -> Self {
        Self {
            state: ServiceState::Uninitialized,
            shared: None,
            packet_sender: None,
            packet_receiver: None,
            endpoint: None,
            queue: None,
            threads: Vec::new(),
        }
    }

    /// Allocates the collection and queues.
    ///
    /// Allowed before [`CacheService::start`]; re-initializing discards cached packets.
    pub fn initialize(&mut self, options: ServiceOptions) -> AppResult<()> {
        if matches!(self.state, ServiceState::Running | ServiceState::Stopped) {
            return Err(self.invalid_state("initialize"));
        }
        options.validate()?;
        let collection = CappedCollection::with_settings(options.collection.clone())?;
        let (packet_sender, packet_receiver) = bounded(options.ingest_queue_capacity);
        let (endpoint, queue) = request_channel(options.request_queue_capacity);

        info!(
            per_channel = options.collection.max_packets_per_channel,
            total = options.collection.max_total_packets,
            workers = options.query_workers,
            "Packet cache initialized"
        );
        self.shared = Some(Arc::new(Shared {
            collection,
            options,
            running: AtomicBool::new(false),
        }));
        self.packet_sender = Some(packet_sender);
        self.packet_receiver = Some(packet_receiver);
        self.endpoint = Some(endpoint);
        self.queue = Some(queue);
        self.state = ServiceState::Initialized;
        Ok(())
    }

    /// Spawns the ingestion thread and the query workers.
    pub fn start(&mut self) -> AppResult<()> {
        if self.state != ServiceState::Initialized {
            return Err(self.invalid_state("start"));
        }
        let shared = Arc::clone(self.shared()?);
        let packets = self
            .packet_receiver
            .clone()
            .ok_or(CacheError::NotInitialized("packet queue"))?;
        let queue = self
            .queue
            .clone()
            .ok_or(CacheError::NotInitialized("request queue"))?;

        shared.running.store(true, Ordering::Release);
        let ingest = {
            let shared = Arc::clone(&shared);
            spawn_named("packet-cache-ingest".to_string(), move || {
                ingest_loop(&shared, &packets)
            })
        };
        match ingest {
            Ok(handle) => self.threads.push(handle),
            Err(e) => {
                shared.running.store(false, Ordering::Release);
                return Err(e);
            }
        }
        for index in 0..shared.options.query_workers {
            let worker_shared = Arc::clone(&shared);
            let worker_queue = queue.clone();
            let spawned = spawn_named(format!("packet-cache-worker-{index}"), move || {
                worker_loop(&worker_shared, &worker_queue)
            });
            match spawned {
                Ok(handle) => self.threads.push(handle),
                Err(e) => {
                    self.shutdown_threads();
                    self.state = ServiceState::Stopped;
                    return Err(e);
                }
            }
        }

        self.state = ServiceState::Running;
        info!(threads = self.threads.len(), "Packet cache started");
        Ok(())
    }

    /// Stops accepting requests, drains the request queue with failures and joins threads.
    ///
    /// Stopping an already stopped service is a no-op.
    pub fn stop(&mut self) -> AppResult<()> {
        match self.state {
            ServiceState::Uninitialized => return Err(self.invalid_state("stop")),
            ServiceState::Stopped => return Ok(()),
            ServiceState::Initialized | ServiceState::Running => {}
        }
        self.shutdown_threads();
        self.state = ServiceState::Stopped;
        info!("Packet cache stopped");
        Ok(())
    }

    fn shutdown_threads(&mut self) {
        if let Some(queue) = &self.queue {
            queue.close();
        }
        if let Some(shared) = &self.shared {
            shared.running.store(false, Ordering::Release);
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("A packet cache thread panicked");
            }
        }
        if let Some(queue) = &self.queue {
            let mut rejected = 0usize;
            while let Some(request) = queue.try_recv() {
                reject(request, "service stopped before the request was processed");
                rejected += 1;
            }
            if rejected > 0 {
                warn!(rejected, "Answered queued requests with failures at shutdown");
            }
        }
        if let Some(receiver) = &self.packet_receiver {
            if !receiver.is_empty() {
                debug!(discarded = receiver.len(), "Discarding queued packets at shutdown");
            }
        }
    }

    fn invalid_state(&self, operation: &'static str) -> CacheError {
        CacheError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }

    fn shared(&self) -> AppResult<&Arc<Shared<T>>> {
        self.shared
            .as_ref()
            .ok_or(CacheError::NotInitialized("packet cache service"))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// True once initialized, including while running or after stopping.
    pub fn is_initialized(&self) -> bool {
        self.state != ServiceState::Uninitialized
    }

    /// True between [`CacheService::start`] and [`CacheService::stop`].
    pub fn is_running(&self) -> bool {
        self.state == ServiceState::Running
    }

    /// Adds a packet directly, bypassing the ingestion queue.
    pub fn ingest(&self, packet: Packet<T>) -> AppResult<AddOutcome> {
        if !matches!(self.state, ServiceState::Initialized | ServiceState::Running) {
            return Err(self.invalid_state("ingest"));
        }
        self.shared()?.collection.add_packet(packet)
    }

    /// Producer handle for the bounded ingestion queue.
    ///
    /// Senders block when the queue is full, which is the backpressure applied to
    /// producers that outpace the cache.
    pub fn packet_sender(&self) -> AppResult<Sender<Packet<T>>> {
        self.packet_sender
            .clone()
            .ok_or(CacheError::NotInitialized("packet cache service"))
    }

    /// Entry point for encoded requests.
    pub fn endpoint(&self) -> AppResult<Endpoint> {
        self.endpoint
            .clone()
            .ok_or(CacheError::NotInitialized("packet cache service"))
    }

    /// Packets cached across all channels.
    pub fn total_packets(&self) -> usize {
        self.shared
            .as_ref()
            .map_or(0, |shared| shared.collection.total_packets())
    }

    /// The underlying collection.
    pub fn collection(&self) -> AppResult<&CappedCollection<T>> {
        Ok(&self.shared()?.collection)
    }

    /// Answers a sensor-list request in-process.
    pub fn handle_sensor_request(&self, request: &SensorRequest) -> AppResult<SensorResponse> {
        Ok(self.shared()?.sensor_response(request))
    }

    /// Answers a single-channel request in-process.
    pub fn handle_data_request(&self, request: &DataRequest) -> AppResult<DataResponse> {
        Ok(self.shared()?.data_response(request))
    }

    /// Answers a three-component request in-process.
    pub fn handle_three_component_request(
        &self,
        request: &ThreeComponentDataRequest,
    ) -> AppResult<ThreeComponentDataResponse> {
        Ok(self.shared()?.three_component_response(request))
    }

    /// Answers a bulk request in-process.
    pub fn handle_bulk_request(&self, request: &BulkDataRequest) -> AppResult<BulkDataResponse> {
        Ok(self.shared()?.bulk_response(request))
    }

    /// Decodes, dispatches and encodes one request envelope.
    pub fn handle_envelope(&self, envelope: &Envelope) -> AppResult<Envelope> {
        Ok(self.shared()?.handle_envelope(envelope))
    }
}

impl<T: Sample> Drop for CacheService<T> {
    fn drop(&mut self) {
        if self.state == ServiceState::Running {
            self.shutdown_threads();
            self.state = ServiceState::Stopped;
        }
    }
}

fn spawn_named<F>(name: String, body: F) -> AppResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|e| CacheError::ServiceUnavailable(format!("failed to spawn {name}: {e}")))
}

fn ingest_loop<T: Sample>(shared: &Shared<T>, packets: &Receiver<Packet<T>>) {
    debug!("Ingestion thread started");
    while shared.running.load(Ordering::Acquire) {
        match packets.recv_timeout(shared.options.poll_interval) {
            Ok(packet) => {
                if let Err(e) = shared.collection.add_packet(packet) {
                    warn!(error = %e, "Rejected packet");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Ingestion thread exiting");
}

fn worker_loop<T: Sample>(shared: &Shared<T>, queue: &RequestQueue) {
    debug!("Query worker started");
    while shared.running.load(Ordering::Acquire) {
        if let Some(request) = queue.recv_timeout(shared.options.poll_interval) {
            let response = shared.handle_envelope(request.envelope());
            request.respond(response);
        }
    }
    debug!("Query worker exiting");
}

fn reject(request: IncomingRequest, details: &str) {
    let format = request.envelope().format;
    let failure = FailureResponse {
        identifier: 0,
        return_code: ReturnCode::AlgorithmicFailure,
        details: details.to_string(),
    };
    request.respond(encode_failure(&failure, format));
}

fn encode_failure(failure: &FailureResponse, format: crate::codec::MessageFormat) -> Envelope {
    Envelope::encode(failure, format).unwrap_or_else(|e| {
        error!(error = %e, "Could not encode failure response");
        Envelope {
            message_type: FailureResponse::MESSAGE_TYPE.to_string(),
            format,
            payload: Vec::new(),
        }
    })
}

/// Maps an interpolation error to the code reported to the requestor.
fn return_code_for(error: &CacheError) -> ReturnCode {
    match error {
        CacheError::IncompatibleSamplingRate { .. } => ReturnCode::IncompatibleSamplingRate,
        CacheError::InvalidTimeWindow { .. } | CacheError::WindowTooLarge { .. } => {
            ReturnCode::InvalidTimeQuery
        }
        CacheError::InvalidWaveform(_) | CacheError::Configuration(_) => {
            ReturnCode::InvalidMessage
        }
        _ => ReturnCode::AlgorithmicFailure,
    }
}

impl<T: Sample> Shared<T> {
    fn handle_envelope(&self, envelope: &Envelope) -> Envelope {
        if envelope.is::<SensorRequest>() {
            self.answer(envelope, |r: SensorRequest| self.sensor_response(&r))
        } else if envelope.is::<DataRequest>() {
            self.answer(envelope, |r: DataRequest| self.data_response(&r))
        } else if envelope.is::<ThreeComponentDataRequest>() {
            self.answer(envelope, |r: ThreeComponentDataRequest| {
                self.three_component_response(&r)
            })
        } else if envelope.is::<BulkDataRequest>() {
            self.answer(envelope, |r: BulkDataRequest| self.bulk_response(&r))
        } else {
            warn!(message_type = %envelope.message_type, "Unhandled message type");
            encode_failure(
                &FailureResponse {
                    identifier: 0,
                    return_code: ReturnCode::InvalidMessageType,
                    details: format!("unhandled message type {}", envelope.message_type),
                },
                envelope.format,
            )
        }
    }

    fn answer<Req, Resp>(&self, envelope: &Envelope, handler: impl FnOnce(Req) -> Resp) -> Envelope
    where
        Req: Message,
        Resp: Message,
    {
        let request = match envelope.decode::<Req>() {
            Ok(request) => request,
            Err(e) => {
                error!(message_type = %envelope.message_type, error = %e, "Malformed request");
                return encode_failure(
                    &FailureResponse {
                        identifier: 0,
                        return_code: ReturnCode::InvalidMessage,
                        details: e.to_string(),
                    },
                    envelope.format,
                );
            }
        };
        let identifier = request.identifier();
        let response = handler(request);
        Envelope::encode(&response, envelope.format).unwrap_or_else(|e| {
            error!(error = %e, identifier, "Could not encode response");
            encode_failure(
                &FailureResponse {
                    identifier,
                    return_code: ReturnCode::AlgorithmicFailure,
                    details: e.to_string(),
                },
                envelope.format,
            )
        })
    }

    fn sensor_response(&self, request: &SensorRequest) -> SensorResponse {
        SensorResponse {
            identifier: request.identifier,
            sensors: self.collection.sensors(),
            return_code: ReturnCode::Success,
        }
    }

    /// Output rate for a channel: request override, configuration, then the packets.
    fn target_rate(
        &self,
        requested: Option<f64>,
        channel: &ChannelId,
        packets: &[Arc<Packet<T>>],
    ) -> f64 {
        requested
            .or_else(|| self.options.sampling_rate_for(channel))
            .or_else(|| packets.first().map(|p| p.sampling_rate()))
            .unwrap_or(crate::interpolate::DEFAULT_SAMPLING_RATE)
    }

    /// Query window widened so grid points near the edges can be bracketed.
    fn padded_window(&self, start: i64, end: i64, rate: Option<f64>) -> (i64, i64) {
        let tolerance = i64::try_from(self.options.gap_tolerance.as_micros()).unwrap_or(i64::MAX);
        let period = rate
            .filter(|r| r.is_finite() && *r > 0.0)
            .map_or(0, |r| sampling_period_microseconds(r).ceil() as i64);
        let pad = tolerance.saturating_add(period);
        (start.saturating_sub(pad), end.saturating_add(pad))
    }

    fn interpolator(&self, rate: f64) -> AppResult<WigginsInterpolator> {
        Ok(WigginsInterpolator::new(rate, self.options.gap_tolerance)?
            .with_max_points(self.options.max_query_samples))
    }

    /// Packets around the window, oldest arrival first so the freshest data wins
    /// where packets overlap.
    fn window_packets(
        &self,
        channel: &ChannelId,
        start: i64,
        end: i64,
        rate: Option<f64>,
    ) -> AppResult<Vec<Arc<Packet<T>>>> {
        let (padded_start, padded_end) = self.padded_window(start, end, rate);
        self.collection
            .packets_by_arrival(channel, padded_start, padded_end)
    }

    fn data_response(&self, request: &DataRequest) -> DataResponse {
        let DataRequest {
            identifier,
            ref channel,
            start_time,
            end_time,
            sampling_rate,
        } = *request;
        let fail = |code: ReturnCode| DataResponse::failure(identifier, channel.clone(), code);

        if start_time > end_time {
            debug!(channel = %channel, start_time, end_time, "Rejecting inverted time window");
            return fail(ReturnCode::InvalidTimeQuery);
        }
        if !self.collection.have_sensor(channel) {
            return fail(ReturnCode::NoSensor);
        }
        let hint = sampling_rate.or_else(|| self.options.sampling_rate_for(channel));
        let packets = match self.window_packets(channel, start_time, end_time, hint) {
            Ok(packets) => packets,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Packet query failed");
                return fail(return_code_for(&e));
            }
        };
        if packets.is_empty() {
            return fail(ReturnCode::NoData);
        }

        let rate = self.target_rate(sampling_rate, channel, &packets);
        let waveform = self.interpolator(rate).and_then(
            |interpolator| {
                SingleComponentWaveform::from_packets(
                    &interpolator,
                    channel.clone(),
                    &packets,
                    start_time,
                    end_time,
                )
            },
        );
        match waveform {
            Ok(waveform) if waveform.is_all_gap() => fail(ReturnCode::NoData),
            Ok(waveform) => DataResponse::success(identifier, waveform),
            Err(e) => {
                warn!(channel = %channel, error = %e, "Interpolation failed");
                fail(return_code_for(&e))
            }
        }
    }

    fn three_component_response(
        &self,
        request: &ThreeComponentDataRequest,
    ) -> ThreeComponentDataResponse {
        let identifier = request.identifier;
        let fail = |return_code: ReturnCode| ThreeComponentDataResponse {
            identifier,
            return_code,
            waveform: None,
        };

        if let Err(e) = check_components(&request.vertical, &request.north, &request.east) {
            warn!(error = %e, "Rejecting three-component request");
            return fail(ReturnCode::InvalidMessage);
        }
        if request.start_time > request.end_time {
            return fail(ReturnCode::InvalidTimeQuery);
        }
        if request
            .channels()
            .iter()
            .any(|channel| !self.collection.have_sensor(channel))
        {
            return fail(ReturnCode::NoSensor);
        }

        let hint = request
            .sampling_rate
            .or_else(|| self.options.sampling_rate_for(&request.vertical));
        let mut component_packets = Vec::with_capacity(3);
        for channel in request.channels() {
            match self.window_packets(channel, request.start_time, request.end_time, hint) {
                Ok(packets) if packets.is_empty() => return fail(ReturnCode::NoData),
                Ok(packets) => component_packets.push(packets),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Packet query failed");
                    return fail(return_code_for(&e));
                }
            }
        }

        let rate = self.target_rate(
            request.sampling_rate,
            &request.vertical,
            &component_packets[0],
        );
        let waveform = self.interpolator(rate).and_then(
            |interpolator| {
                ThreeComponentWaveform::from_packets(
                    &interpolator,
                    [
                        request.vertical.clone(),
                        request.north.clone(),
                        request.east.clone(),
                    ],
                    [
                        component_packets[0].as_slice(),
                        component_packets[1].as_slice(),
                        component_packets[2].as_slice(),
                    ],
                    request.start_time,
                    request.end_time,
                )
            },
        );
        match waveform {
            Ok(waveform) if waveform.vertical().is_all_gap() => fail(ReturnCode::NoData),
            Ok(waveform) => ThreeComponentDataResponse {
                identifier,
                return_code: ReturnCode::Success,
                waveform: Some(waveform),
            },
            Err(e) => {
                warn!(station = %request.vertical, error = %e, "Interpolation failed");
                fail(return_code_for(&e))
            }
        }
    }

    /// Answers every item in request order, spreading lookups over scoped threads.
    fn bulk_response(&self, request: &BulkDataRequest) -> BulkDataResponse {
        let items = &request.requests;
        let workers = self.options.query_workers.max(1);
        let responses: Vec<DataResponse> = if items.len() <= 1 || workers == 1 {
            items.iter().map(|item| self.data_response(item)).collect()
        } else {
            let chunk_size = items.len().div_ceil(workers);
            thread::scope(|scope| {
                let handles: Vec<_> = items
                    .chunks(chunk_size)
                    .map(|chunk| {
                        scope.spawn(move || {
                            chunk
                                .iter()
                                .map(|item| self.data_response(item))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .zip(items.chunks(chunk_size))
                    .flat_map(|(handle, chunk)| {
                        handle.join().unwrap_or_else(|_| {
                            error!("Bulk lookup thread panicked");
                            chunk
                                .iter()
                                .map(|item| {
                                    DataResponse::failure(
                                        item.identifier,
                                        item.channel.clone(),
                                        ReturnCode::AlgorithmicFailure,
                                    )
                                })
                                .collect()
                        })
                    })
                    .collect()
            })
        };
        BulkDataResponse {
            identifier: request.identifier,
            return_code: ReturnCode::Success,
            responses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageFormat;

    fn id(channel: &str) -> ChannelId {
        ChannelId::new("UU", "FORK", channel, "01").unwrap()
    }

    /// One-second, 100 Hz packet of a constant value.
    fn packet(channel: &str, second: i64, value: i32) -> Packet<i32> {
        Packet::new(id(channel), second * 1_000_000, 100.0, vec![value; 100]).unwrap()
    }

    fn options() -> ServiceOptions {
        ServiceOptions {
            collection: CollectionSettings::new(10, 100),
            query_workers: 2,
            ..ServiceOptions::default()
        }
    }

    fn initialized() -> CacheService<i32> {
        let mut service = CacheService::new();
        service.initialize(options()).unwrap();
        service
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut service = CacheService::<i32>::new();
        assert_eq!(service.state(), ServiceState::Uninitialized);
        assert!(matches!(service.start(), Err(CacheError::InvalidState { .. })));
        assert!(service.stop().is_err());

        service.initialize(options()).unwrap();
        assert!(service.is_initialized());
        service.start().unwrap();
        assert!(service.is_running());
        assert!(service.initialize(options()).is_err());

        service.stop().unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(service.stop().is_ok());
        assert!(matches!(service.start(), Err(CacheError::InvalidState { .. })));
        assert!(service.ingest(packet("HHZ", 0, 1)).is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut service = CacheService::<i32>::new();
        let options = ServiceOptions {
            query_workers: 0,
            ..options()
        };
        assert!(matches!(
            service.initialize(options),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_channel_is_no_sensor() {
        let service = initialized();
        let response = service
            .handle_data_request(&DataRequest::new(id("HHZ"), 0, 1_000_000))
            .unwrap();
        assert_eq!(response.return_code, ReturnCode::NoSensor);
        assert!(response.waveform.is_none());
    }

    #[test]
    fn test_empty_window_is_no_data() {
        let service = initialized();
        service.ingest(packet("HHZ", 0, 1)).unwrap();
        let response = service
            .handle_data_request(&DataRequest::new(id("HHZ"), 100_000_000, 101_000_000))
            .unwrap();
        assert_eq!(response.return_code, ReturnCode::NoData);
    }

    #[test]
    fn test_inverted_window_is_invalid_time_query() {
        let service = initialized();
        service.ingest(packet("HHZ", 0, 1)).unwrap();
        let response = service
            .handle_data_request(&DataRequest::new(id("HHZ"), 10, 0))
            .unwrap();
        assert_eq!(response.return_code, ReturnCode::InvalidTimeQuery);
    }

    #[test]
    fn test_data_request_returns_waveform() {
        let service = initialized();
        service.ingest(packet("HHZ", 0, 5)).unwrap();
        service.ingest(packet("HHZ", 1, 5)).unwrap();
        let request = DataRequest::new(id("HHZ"), 500_000, 1_500_000).with_identifier(9);
        let response = service.handle_data_request(&request).unwrap();
        assert_eq!(response.identifier, 9);
        assert_eq!(response.return_code, ReturnCode::Success);
        let waveform = response.waveform.unwrap();
        assert_eq!(waveform.len(), 100);
        assert!(waveform.samples().iter().all(|s| *s == Some(5.0)));
    }

    #[test]
    fn test_oversized_window_is_invalid_time_query() {
        let service = initialized();
        for channel in ["HHZ", "HHN", "HHE"] {
            service.ingest(packet(channel, 0, 1)).unwrap();
        }
        for (start, end) in [(0, i64::MAX), (i64::MIN + 1, i64::MAX), (i64::MIN, 0)] {
            let response = service
                .handle_data_request(&DataRequest::new(id("HHZ"), start, end))
                .unwrap();
            assert_eq!(response.return_code, ReturnCode::InvalidTimeQuery);
        }
        let request =
            ThreeComponentDataRequest::new(id("HHZ"), id("HHN"), id("HHE"), 0, i64::MAX);
        let response = service.handle_three_component_request(&request).unwrap();
        assert_eq!(response.return_code, ReturnCode::InvalidTimeQuery);
    }

    #[test]
    fn test_query_sample_limit_is_configurable() {
        let mut service = CacheService::new();
        service
            .initialize(ServiceOptions {
                max_query_samples: 50,
                ..options()
            })
            .unwrap();
        service.ingest(packet("HHZ", 0, 1)).unwrap();
        let short = service
            .handle_data_request(&DataRequest::new(id("HHZ"), 0, 500_000))
            .unwrap();
        assert_eq!(short.return_code, ReturnCode::Success);
        let long = service
            .handle_data_request(&DataRequest::new(id("HHZ"), 0, 1_000_000))
            .unwrap();
        assert_eq!(long.return_code, ReturnCode::InvalidTimeQuery);
    }

    #[test]
    fn test_latest_arrival_wins_where_packets_overlap() {
        let late = Packet::new(id("HHZ"), 5_000_000, 100.0, vec![100; 500]).unwrap();
        let wide = Packet::new(id("HHZ"), 0, 100.0, vec![0; 1000]).unwrap();
        let request = DataRequest::new(id("HHZ"), 0, 10_000_000);

        let service = initialized();
        service.ingest(late.clone()).unwrap();
        service.ingest(wide.clone()).unwrap();
        let samples = service
            .handle_data_request(&request)
            .unwrap()
            .waveform
            .unwrap()
            .samples()
            .to_vec();
        assert_eq!(samples.len(), 1000);
        assert_eq!(samples[700], Some(0.0));
        assert!(samples.iter().all(|s| *s == Some(0.0)));

        let service = initialized();
        service.ingest(wide).unwrap();
        service.ingest(late).unwrap();
        let samples = service
            .handle_data_request(&request)
            .unwrap()
            .waveform
            .unwrap()
            .samples()
            .to_vec();
        assert_eq!(samples[400], Some(0.0));
        assert_eq!(samples[700], Some(100.0));
    }

    #[test]
    fn test_rate_override_mismatch_is_reported() {
        let service = initialized();
        service.ingest(packet("HHZ", 0, 5)).unwrap();
        let request = DataRequest::new(id("HHZ"), 0, 500_000).with_sampling_rate(40.0);
        let response = service.handle_data_request(&request).unwrap();
        assert_eq!(response.return_code, ReturnCode::IncompatibleSamplingRate);
    }

    #[test]
    fn test_three_component_rejects_mixed_sites() {
        let service = initialized();
        let request = ThreeComponentDataRequest::new(
            id("HHZ"),
            ChannelId::new("UU", "CTU", "HHN", "01").unwrap(),
            id("HHE"),
            0,
            1_000_000,
        );
        let response = service.handle_three_component_request(&request).unwrap();
        assert_eq!(response.return_code, ReturnCode::InvalidMessage);
    }

    #[test]
    fn test_bulk_preserves_order() {
        let service = initialized();
        service.ingest(packet("HHZ", 0, 1)).unwrap();
        service.ingest(packet("HHN", 0, 2)).unwrap();
        let requests = vec![
            DataRequest::new(id("HHN"), 0, 500_000).with_identifier(1),
            DataRequest::new(id("XXX"), 0, 500_000).with_identifier(2),
            DataRequest::new(id("HHZ"), 0, 500_000).with_identifier(3),
        ];
        let response = service
            .handle_bulk_request(&BulkDataRequest::new(77, requests))
            .unwrap();
        assert_eq!(response.identifier, 77);
        let ids: Vec<u64> = response.responses.iter().map(|r| r.identifier).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let codes: Vec<ReturnCode> = response.responses.iter().map(|r| r.return_code).collect();
        assert_eq!(
            codes,
            vec![ReturnCode::Success, ReturnCode::NoSensor, ReturnCode::Success]
        );
    }

    #[test]
    fn test_unknown_envelope_type_fails() {
        let service = initialized();
        let envelope = Envelope {
            message_type: "Unknown".to_string(),
            format: MessageFormat::Json,
            payload: b"{}".to_vec(),
        };
        let response = service.handle_envelope(&envelope).unwrap();
        let failure: FailureResponse = response.decode().unwrap();
        assert_eq!(failure.return_code, ReturnCode::InvalidMessageType);
    }

    #[test]
    fn test_malformed_envelope_fails() {
        let service = initialized();
        let envelope = Envelope {
            message_type: DataRequest::MESSAGE_TYPE.to_string(),
            format: MessageFormat::Json,
            payload: b"not json".to_vec(),
        };
        let failure: FailureResponse = service
            .handle_envelope(&envelope)
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(failure.return_code, ReturnCode::InvalidMessage);
    }

    #[test]
    fn test_queued_packets_are_ingested() {
        let mut service = initialized();
        service.start().unwrap();
        let sender = service.packet_sender().unwrap();
        for second in 0..5 {
            sender.send(packet("HHZ", second, 1)).unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while service.total_packets() < 5 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(service.total_packets(), 5);
        service.stop().unwrap();
    }
}
