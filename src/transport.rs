//! In-process request transport built on crossbeam channels.
//!
//! An [`Endpoint`] is the client side: it sends an encoded [`Envelope`] together with
//! a one-shot reply channel. A [`RequestQueue`] is the service side: workers pull
//! [`IncomingRequest`]s and answer through [`IncomingRequest::respond`]. A network
//! transport would replace this module behind the same two types.
//!
//! Closing the queue makes every endpoint reject new sends with
//! [`CacheError::ServiceUnavailable`]; requests already queued can still be drained.

use crate::codec::Envelope;
use crate::error::{AppResult, CacheError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Creates a connected endpoint and request queue holding at most `capacity` requests.
pub fn request_channel(capacity: usize) -> (Endpoint, RequestQueue) {
    let (sender, receiver) = bounded(capacity);
    let open = Arc::new(AtomicBool::new(true));
    (
        Endpoint {
            sender,
            open: Arc::clone(&open),
        },
        RequestQueue { receiver, open },
    )
}

/// A request waiting for a worker.
#[derive(Debug)]
pub struct IncomingRequest {
    envelope: Envelope,
    reply: Sender<Envelope>,
}

impl IncomingRequest {
    /// The encoded request.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Sends the response; a requestor that already gave up is not an error.
    pub fn respond(self, response: Envelope) {
        if self.reply.send(response).is_err() {
            debug!(
                message_type = %self.envelope.message_type,
                "Requestor went away before the response was ready"
            );
        }
    }
}

/// Client side of the transport; cheap to clone.
#[derive(Debug, Clone)]
pub struct Endpoint {
    sender: Sender<IncomingRequest>,
    open: Arc<AtomicBool>,
}

impl Endpoint {
    /// Queues a request and returns the channel its response will arrive on.
    ///
    /// Fails immediately when the service is stopped or its queue is full.
    pub fn send(&self, envelope: Envelope) -> AppResult<Receiver<Envelope>> {
        if !self.is_open() {
            return Err(CacheError::ServiceUnavailable("service is not accepting requests".into()));
        }
        let (reply, response) = bounded(1);
        match self.sender.try_send(IncomingRequest { envelope, reply }) {
            Ok(()) => Ok(response),
            Err(TrySendError::Full(_)) => Err(CacheError::ServiceUnavailable(
                "request queue is full".into(),
            )),
            Err(TrySendError::Disconnected(_)) => Err(CacheError::ServiceUnavailable(
                "service has shut down".into(),
            )),
        }
    }

    /// True while the service accepts requests.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Service side of the transport.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    receiver: Receiver<IncomingRequest>,
    open: Arc<AtomicBool>,
}

impl RequestQueue {
    /// Waits up to `timeout` for the next request.
    ///
    /// Returns `None` on timeout or once every endpoint is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<IncomingRequest> {
        match self.receiver.recv_timeout(timeout) {
            Ok(request) => Some(request),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Takes a queued request without waiting.
    pub fn try_recv(&self) -> Option<IncomingRequest> {
        self.receiver.try_recv().ok()
    }

    /// Stops endpoints from queueing further requests.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// True until [`RequestQueue::close`] is called.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Requests currently queued.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// True when no requests are queued.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageFormat;
    use crate::messages::SensorRequest;

    fn envelope() -> Envelope {
        Envelope::encode(&SensorRequest::new(1), MessageFormat::Json).unwrap()
    }

    #[test]
    fn test_request_and_reply() {
        let (endpoint, queue) = request_channel(4);
        let response = endpoint.send(envelope()).unwrap();
        let request = queue.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(request.envelope(), &envelope());
        request.respond(envelope());
        assert_eq!(response.recv().unwrap(), envelope());
    }

    #[test]
    fn test_closed_queue_rejects_sends() {
        let (endpoint, queue) = request_channel(4);
        queue.close();
        assert!(!endpoint.is_open());
        assert!(matches!(
            endpoint.send(envelope()),
            Err(CacheError::ServiceUnavailable(_))
        ));
    }

    #[test]
    fn test_full_queue_rejects_sends() {
        let (endpoint, queue) = request_channel(1);
        let _pending = endpoint.send(envelope()).unwrap();
        assert!(endpoint.send(envelope()).is_err());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_dropped_requestor_is_tolerated() {
        let (endpoint, queue) = request_channel(1);
        drop(endpoint.send(envelope()).unwrap());
        let request = queue.try_recv().unwrap();
        request.respond(envelope());
        assert!(queue.is_empty());
    }
}
