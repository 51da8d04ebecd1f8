//! Blocking client for the cache service.
//!
//! A [`Requestor`] encodes a request, sends it through an [`Endpoint`] and waits at
//! most the configured timeout for the matching response. There are no retries; a
//! timed-out request surfaces as [`CacheError::RequestTimedOut`] and the caller decides
//! what to do (see [`CacheError::is_retryable`]).

use crate::codec::{Envelope, MessageFormat};
use crate::config::CacheConfig;
use crate::error::{AppResult, CacheError};
use crate::messages::{
    BulkDataRequest, BulkDataResponse, DataRequest, DataResponse, FailureResponse, Message,
    SensorRequest, SensorResponse, ThreeComponentDataRequest, ThreeComponentDataResponse,
};
use crate::packet::ChannelId;
use crate::transport::Endpoint;
use crossbeam_channel::RecvTimeoutError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Requestor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestorOptions {
    /// How long to wait for each response
    pub timeout: Duration,
    /// Envelope encoding
    pub format: MessageFormat,
}

impl Default for RequestorOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            format: MessageFormat::Binary,
        }
    }
}

impl RequestorOptions {
    /// Options from the `[requestor]` configuration section.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            timeout: config.requestor.timeout,
            format: config.requestor.format,
        }
    }
}

/// Request/response proxy with a bounded wait.
#[derive(Debug)]
pub struct Requestor {
    endpoint: Option<Endpoint>,
    options: RequestorOptions,
    next_identifier: AtomicU64,
}

impl Default for Requestor {
    fn default() -> Self {
        Self::new()
    }
}

impl Requestor {
    /// Creates an unconnected requestor.
    pub fn new() -> Self {
        Self {
            endpoint: None,
            options: RequestorOptions::default(),
            next_identifier: AtomicU64::new(1),
        }
    }

    /// Connects to a service endpoint.
    pub fn initialize(
        &mut self,
        endpoint: Endpoint,
        options: RequestorOptions,
    ) -> AppResult<()> {
        if options.timeout.is_zero() {
            return Err(CacheError::Configuration(
                "requestor timeout must be positive".into(),
            ));
        }
        self.endpoint = Some(endpoint);
        self.options = options;
        Ok(())
    }

    /// True once connected.
    pub fn is_initialized(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Active options.
    pub fn options(&self) -> RequestorOptions {
        self.options
    }

    /// Identifier for requests built by the convenience methods.
    fn identifier(&self) -> u64 {
        self.next_identifier.fetch_add(1, Ordering::Relaxed)
    }

    /// Lists the channels currently cached.
    pub fn sensors(&self) -> AppResult<Vec<ChannelId>> {
        let response: SensorResponse = self.request(&SensorRequest::new(self.identifier()))?;
        Ok(response.sensors)
    }

    /// Requests one channel over `[start_time, end_time)`.
    pub fn data(&self, request: &DataRequest) -> AppResult<DataResponse> {
        self.request(request)
    }

    /// Requests one channel using a generated identifier.
    pub fn data_for(
        &self,
        channel: &ChannelId,
        start_time: i64,
        end_time: i64,
    ) -> AppResult<DataResponse> {
        let request = DataRequest::new(channel.clone(), start_time, end_time)
            .with_identifier(self.identifier());
        self.request(&request)
    }

    /// Requests three aligned components.
    pub fn three_component_data(
        &self,
        request: &ThreeComponentDataRequest,
    ) -> AppResult<ThreeComponentDataResponse> {
        self.request(request)
    }

    /// Requests several channels at once; responses come back in request order.
    pub fn bulk_data(&self, request: &BulkDataRequest) -> AppResult<BulkDataResponse> {
        self.request(request)
    }

    /// Sends any request and waits for its typed response.
    pub fn request<Req, Resp>(&self, request: &Req) -> AppResult<Resp>
    where
        Req: Message,
        Resp: Message,
    {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or(CacheError::NotInitialized("requestor"))?;
        let envelope = Envelope::encode(request, self.options.format)?;
        let replies = endpoint.send(envelope)?;
        debug!(
            message_type = Req::MESSAGE_TYPE,
            identifier = request.identifier(),
            "Request sent"
        );

        let reply = match replies.recv_timeout(self.options.timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    message_type = Req::MESSAGE_TYPE,
                    identifier = request.identifier(),
                    timeout = ?self.options.timeout,
                    "Request timed out"
                );
                return Err(CacheError::RequestTimedOut(self.options.timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CacheError::ServiceUnavailable(
                    "service dropped the request".into(),
                ));
            }
        };

        if reply.is::<FailureResponse>() {
            let failure: FailureResponse = reply.decode()?;
            warn!(return_code = %failure.return_code, details = %failure.details, "Request failed");
            return Err(CacheError::RemoteFailure(format!(
                "{}: {}",
                failure.return_code, failure.details
            )));
        }
        let response: Resp = reply.decode()?;
        if response.identifier() != request.identifier() {
            return Err(CacheError::Codec(format!(
                "response identifier {} does not match request {}",
                response.identifier(),
                request.identifier()
            )));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::request_channel;

    #[test]
    fn test_uninitialized_requestor_fails() {
        let requestor = Requestor::new();
        assert!(matches!(
            requestor.sensors(),
            Err(CacheError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let (endpoint, _queue) = request_channel(1);
        let mut requestor = Requestor::new();
        let options = RequestorOptions {
            timeout: Duration::ZERO,
            ..RequestorOptions::default()
        };
        assert!(requestor.initialize(endpoint, options).is_err());
        assert!(!requestor.is_initialized());
    }

    #[test]
    fn test_unanswered_request_times_out() {
        let (endpoint, _queue) = request_channel(4);
        let mut requestor = Requestor::new();
        requestor
            .initialize(
                endpoint,
                RequestorOptions {
                    timeout: Duration::from_millis(20),
                    format: MessageFormat::Json,
                },
            )
            .unwrap();
        let err = requestor.sensors().unwrap_err();
        assert!(matches!(err, CacheError::RequestTimedOut(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_failure_reply_becomes_remote_failure() {
        let (endpoint, queue) = request_channel(4);
        let responder = std::thread::spawn(move || {
            let request = queue.recv_timeout(Duration::from_secs(5)).unwrap();
            let failure = FailureResponse {
                identifier: 0,
                return_code: crate::messages::ReturnCode::InvalidMessageType,
                details: "nope".into(),
            };
            request.respond(Envelope::encode(&failure, MessageFormat::Binary).unwrap());
        });
        let mut requestor = Requestor::new();
        requestor
            .initialize(endpoint, RequestorOptions::default())
            .unwrap();
        assert!(matches!(
            requestor.sensors(),
            Err(CacheError::RemoteFailure(_))
        ));
        responder.join().unwrap();
    }
}
