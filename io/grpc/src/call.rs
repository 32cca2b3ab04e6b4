//! Client call state machine.
//!
//! Every call is driven by one spawned task that opens the HTTP/2 stream,
//! sends the request head, pumps response messages into a bounded buffer
//! and resolves the final status. The caller holds a [`Call`] handle that
//! reads messages, writes request messages and observes headers and status.
//!
//! A call completes exactly once. The first completion recorded wins:
//! trailers from the server, a transport fault, the deadline timer, or a
//! cancellation from the caller. Deadline and cancellation are recorded
//! before the abort signal fires, so the final code is always exactly
//! `DeadlineExceeded` or `Cancelled`.

use crate::cancel::CancellationToken;
use crate::credentials::{AuthContext, CallCredentials};
use crate::frame::{self, MessageDecoder};
use crate::metadata::{self, Metadata, Timeout};
use crate::method::MethodDescriptor;
use crate::observer::{CallObserver, TracingObserver};
use crate::options::CallOptions;
use crate::status::{Code, Status};
use crate::transport::{BodyFrame, HttpStream, HttpTransport, RequestBody, RequestHead, Scheme, StreamReset};
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

const DEADLINE_EXCEEDED: &str = "Deadline Exceeded";
const CANCELLED_BY_CLIENT: &str = "Call canceled by the client.";
const CALL_COMPLETE: &str = "Can't write the message because the call is complete.";
const DRIVER_PANICKED: &str = "Call failed: the call driver panicked.";

/// Lifecycle phase of a call. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallPhase {
    Created,
    HeadersSent,
    Streaming,
    ResponseReceived,
    Completed,
}

/// The request side of a call as handed to an invoker.
#[derive(Debug, Clone)]
pub enum CallRequest {
    /// A single serialized request message, sent as soon as the stream opens.
    Message(Bytes),
    /// Request messages are written through [`Call::write`].
    Stream,
}

/// Channel-wide settings every call on the channel shares.
pub(crate) struct CallSettings {
    pub(crate) scheme: Scheme,
    pub(crate) authority: String,
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) observer: Arc<dyn CallObserver>,
    pub(crate) max_send_message_size: Option<usize>,
    pub(crate) max_receive_message_size: usize,
    pub(crate) call_credentials: Option<CallCredentials>,
    pub(crate) allow_insecure_call_credentials: bool,
    pub(crate) user_agent: String,
    pub(crate) message_buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Cancellation, deadline, or a fault detected before the exchange.
    Local,
    /// Trailers or a fault observed on the response stream.
    Remote,
}

/// State shared by the driver task and every handle.
struct Shared {
    method: MethodDescriptor,
    observer: Arc<dyn CallObserver>,
    max_send_message_size: Option<usize>,
    phase: Mutex<CallPhase>,
    status: watch::Sender<Option<Status>>,
    headers: watch::Sender<Option<Metadata>>,
    /// Fires once the status is recorded.
    done: CancellationToken,
    aborted_locally: AtomicBool,
    started_at: Instant,
}

impl Shared {
    fn new(method: MethodDescriptor, observer: Arc<dyn CallObserver>, max_send: Option<usize>) -> Self {
        Self {
            method,
            observer,
            max_send_message_size: max_send,
            phase: Mutex::new(CallPhase::Created),
            status: watch::channel(None).0,
            headers: watch::channel(None).0,
            done: CancellationToken::new(),
            aborted_locally: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    /// Record the terminal status. Returns false if the call already had one.
    fn complete(&self, status: Status, origin: Origin) -> bool {
        let observed = status.clone();
        let recorded = self.status.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(status);
            true
        });
        if !recorded {
            return false;
        }

        *self.phase.lock() = CallPhase::Completed;
        if origin == Origin::Local {
            self.aborted_locally.store(true, Ordering::Release);
        }
        self.done.cancel();
        self.observer
            .call_completed(&self.method, &observed, self.started_at.elapsed());
        true
    }

    fn advance(&self, phase: CallPhase) {
        let mut current = self.phase.lock();
        if *current < phase && *current != CallPhase::Completed {
            *current = phase;
        }
    }

    fn set_headers(&self, headers: Metadata) {
        self.headers.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(headers);
            true
        });
    }

    fn status(&self) -> Option<Status> {
        self.status.borrow().clone()
    }

    async fn wait_status(&self) -> Status {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => status.clone(),
            Err(_) => None,
        };
        status.unwrap_or_else(|| Status::internal("call state was dropped"))
    }
}

enum RequestSlot {
    /// Waiting for the driver to open the stream.
    Opening(oneshot::Receiver<RequestBody>),
    Open(RequestBody),
    Closed,
}

enum RequestSink {
    Message(Bytes),
    Stream(oneshot::Sender<RequestBody>),
}

struct CallCore {
    shared: Arc<Shared>,
    request: tokio::sync::Mutex<RequestSlot>,
    request_completed: AtomicBool,
    responses: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    leases: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
}

impl Drop for CallCore {
    fn drop(&mut self) {
        if self.shared.complete(Status::cancelled(CANCELLED_BY_CLIENT), Origin::Local) {
            debug!(method = %self.shared.method, "call dropped before completion");
        }
    }
}

/// Handle to an in-flight call.
///
/// Clones share the same call. When the last handle is dropped an
/// unfinished call is cancelled.
#[derive(Clone)]
pub struct Call {
    core: Arc<CallCore>,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.core.shared.method.path())
            .field("phase", &self.phase())
            .finish()
    }
}

impl Call {
    /// Start a call. Must run inside a tokio runtime.
    pub(crate) fn start(
        method: MethodDescriptor,
        settings: Arc<CallSettings>,
        host: Option<&str>,
        options: CallOptions,
        request: CallRequest,
    ) -> Call {
        let shared = Arc::new(Shared::new(
            method,
            settings.observer.clone(),
            settings.max_send_message_size,
        ));
        shared.observer.call_started(&shared.method);

        let (messages_tx, messages_rx) = mpsc::channel(settings.message_buffer.max(1));
        let (slot, sink, request_completed) = match request {
            CallRequest::Message(payload) => (RequestSlot::Closed, RequestSink::Message(payload), true),
            CallRequest::Stream => {
                let (tx, rx) = oneshot::channel();
                (RequestSlot::Opening(rx), RequestSink::Stream(tx), false)
            }
        };

        let call = Call::from_parts(shared.clone(), slot, request_completed, messages_rx);

        if options.deadline().is_some_and(|deadline| deadline <= Instant::now()) {
            debug!(method = %shared.method, "deadline already passed, call not started");
            shared.complete(Status::deadline_exceeded(DEADLINE_EXCEEDED), Origin::Local);
            return call;
        }

        let host = host.map(str::to_string);
        let driven = AssertUnwindSafe(drive(shared.clone(), settings, host, options, sink, messages_tx));
        tokio::spawn(async move {
            if driven.catch_unwind().await.is_err() {
                warn!(method = %shared.method, "call driver panicked");
                shared.complete(Status::internal(DRIVER_PANICKED), Origin::Local);
            }
        });
        call
    }

    /// A call that completed before it started, for example because the
    /// request failed to serialize.
    pub fn failed(method: MethodDescriptor, status: Status) -> Call {
        let shared = Arc::new(Shared::new(method, Arc::new(TracingObserver), None));
        shared.complete(status, Origin::Local);
        let (_, rx) = mpsc::channel(1);
        Call::from_parts(shared, RequestSlot::Closed, true, rx)
    }

    fn from_parts(
        shared: Arc<Shared>,
        slot: RequestSlot,
        request_completed: bool,
        responses: mpsc::Receiver<Bytes>,
    ) -> Call {
        Call {
            core: Arc::new(CallCore {
                shared,
                request: tokio::sync::Mutex::new(slot),
                request_completed: AtomicBool::new(request_completed),
                responses: tokio::sync::Mutex::new(responses),
                leases: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.core.shared.method
    }

    pub fn phase(&self) -> CallPhase {
        *self.core.shared.phase.lock()
    }

    /// The terminal status, once the call has completed.
    pub fn status(&self) -> Option<Status> {
        self.core.shared.status()
    }

    /// Wait for the call to complete.
    pub async fn wait_status(&self) -> Status {
        self.core.shared.wait_status().await
    }

    /// Trailers received with the terminal status.
    pub fn trailers(&self) -> Option<Metadata> {
        self.status().map(|status| status.trailers().clone())
    }

    /// Wait for the response headers.
    ///
    /// Fails with the call status if the call ends without headers.
    pub async fn response_headers(&self) -> Result<Metadata, Status> {
        let shared = &self.core.shared;
        let mut rx = shared.headers.subscribe();
        tokio::select! {
            biased;
            _ = rx.wait_for(Option::is_some) => {}
            _ = shared.done.cancelled() => {}
        }
        if let Some(headers) = shared.headers.borrow().clone() {
            return Ok(headers);
        }
        match shared.wait_status().await {
            status if status.is_ok() => Ok(Metadata::new()),
            status => Err(status),
        }
    }

    /// Cancel the call. Has no effect once the call has completed.
    pub fn cancel(&self) {
        if self
            .core
            .shared
            .complete(Status::cancelled(CANCELLED_BY_CLIENT), Origin::Local)
        {
            debug!(method = %self.core.shared.method, "call cancelled");
        }
    }

    /// Fail the call locally with `status`.
    pub(crate) fn abort(&self, status: Status) {
        self.core.shared.complete(status, Origin::Local);
    }

    /// Keep `lease` alive for as long as any handle to this call exists.
    pub fn retain(&self, lease: Arc<dyn Any + Send + Sync>) {
        self.core.leases.lock().push(lease);
    }

    pub fn is_request_completed(&self) -> bool {
        self.core.request_completed.load(Ordering::Acquire)
    }

    /// Send one serialized request message.
    ///
    /// Returns once the transport accepted the frame.
    ///
    /// # Panics
    ///
    /// Panics if another write is in progress or the request stream was
    /// already completed.
    pub async fn write(&self, payload: Bytes) -> Result<(), Status> {
        if self.is_request_completed() {
            panic!("request stream has already been completed");
        }
        let mut slot = match self.core.request.try_lock() {
            Ok(slot) => slot,
            Err(_) => panic!("a write is already in progress; only one write may be pending at a time"),
        };

        let shared = &self.core.shared;
        if let Some(status) = shared.status() {
            return Err(write_error(status));
        }
        if let Some(limit) = shared.max_send_message_size
            && payload.len() > limit
        {
            return Err(Status::resource_exhausted(format!(
                "Sending message exceeds the maximum configured message size ({} vs. {limit}).",
                payload.len()
            )));
        }

        if let RequestSlot::Opening(rx) = &mut *slot {
            let opened = tokio::select! {
                biased;
                _ = shared.done.cancelled() => None,
                body = rx => body.ok(),
            };
            match opened {
                Some(body) => *slot = RequestSlot::Open(body),
                None => return Err(write_error(shared.wait_status().await)),
            }
        }

        let RequestSlot::Open(body) = &mut *slot else {
            return Err(write_error(shared.wait_status().await));
        };

        let sent = tokio::select! {
            biased;
            _ = shared.done.cancelled() => false,
            result = body.send(frame::encode_message(&payload)) => result.is_ok(),
        };
        if !sent {
            return Err(write_error(shared.wait_status().await));
        }
        shared.observer.message_sent(&shared.method);
        Ok(())
    }

    /// Half-close the request stream. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if a write is in progress.
    pub fn complete_request(&self) {
        let mut slot = match self.core.request.try_lock() {
            Ok(slot) => slot,
            Err(_) => panic!("cannot complete the request stream while a write is in progress"),
        };
        if self.core.request_completed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping a pending receiver makes the driver end the stream itself.
        if let RequestSlot::Open(body) = std::mem::replace(&mut *slot, RequestSlot::Closed) {
            body.finish();
        }
    }

    /// Read the next response message.
    ///
    /// Returns `Ok(None)` at the end of a successful response. Messages that
    /// arrived before the server reported an error are still returned;
    /// after a local cancellation or deadline the error is returned at once.
    pub async fn read(&self) -> Result<Option<Bytes>, Status> {
        let shared = &self.core.shared;
        let mut responses = self.core.responses.lock().await;
        loop {
            if shared.aborted_locally.load(Ordering::Acquire) {
                return Err(shared.wait_status().await);
            }
            tokio::select! {
                biased;
                _ = shared.done.cancelled(), if !shared.done.is_cancelled() => continue,
                message = responses.recv() => match message {
                    Some(message) => return Ok(Some(message)),
                    None => {
                        let status = shared.wait_status().await;
                        return if status.is_ok() { Ok(None) } else { Err(status) };
                    }
                },
            }
        }
    }
}

fn write_error(status: Status) -> Status {
    if status.is_ok() {
        Status::failed_precondition(CALL_COMPLETE)
    } else {
        status
    }
}

async fn drive(
    shared: Arc<Shared>,
    settings: Arc<CallSettings>,
    host: Option<String>,
    options: CallOptions,
    sink: RequestSink,
    messages: mpsc::Sender<Bytes>,
) {
    let caller_cancelled = async {
        match options.cancellation() {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let deadline_elapsed = async {
        match options.deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    let reset: Mutex<Option<StreamReset>> = Mutex::new(None);

    tokio::select! {
        biased;
        _ = shared.done.cancelled() => {}
        _ = caller_cancelled => {
            shared.complete(Status::cancelled(CANCELLED_BY_CLIENT), Origin::Local);
        }
        _ = deadline_elapsed => {
            debug!(method = %shared.method, "deadline exceeded");
            shared.complete(Status::deadline_exceeded(DEADLINE_EXCEEDED), Origin::Local);
        }
        status = exchange(&shared, &settings, host, &options, sink, messages, &reset) => {
            shared.complete(status, Origin::Remote);
        }
    }

    if let Some(reset) = reset.lock().take() {
        reset.reset();
    }
}

/// Run the HTTP/2 exchange and resolve the status it produced.
async fn exchange(
    shared: &Shared,
    settings: &CallSettings,
    host: Option<String>,
    options: &CallOptions,
    sink: RequestSink,
    messages: mpsc::Sender<Bytes>,
    reset: &Mutex<Option<StreamReset>>,
) -> Status {
    let method = &shared.method;
    let authority = host.unwrap_or_else(|| settings.authority.clone());

    let headers = match request_headers(method, settings, &authority, options).await {
        Ok(headers) => headers,
        Err(status) => return status,
    };

    let head = RequestHead {
        scheme: settings.scheme,
        authority,
        path: method.path().to_string(),
        headers,
    };
    let HttpStream {
        mut body,
        response,
        reset: stream_reset,
    } = match settings.transport.open_stream(head).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(method = %method, error = %e, "failed to open stream");
            return e.into();
        }
    };
    *reset.lock() = Some(stream_reset);
    shared.advance(CallPhase::HeadersSent);

    match sink {
        RequestSink::Message(payload) => {
            if let Some(limit) = settings.max_send_message_size
                && payload.len() > limit
            {
                return Status::resource_exhausted(format!(
                    "Sending message exceeds the maximum configured message size ({} vs. {limit}).",
                    payload.len()
                ));
            }
            // A failed send still leaves the response to explain why.
            if body.send(frame::encode_message(&payload)).await.is_ok() {
                shared.observer.message_sent(method);
            }
            body.finish();
        }
        RequestSink::Stream(tx) => {
            if let Err(body) = tx.send(body) {
                body.finish();
            }
        }
    }

    let (head, mut body) = match response.recv().await {
        Ok(response) => response,
        Err(e) => return e.into(),
    };
    shared.advance(CallPhase::Streaming);

    if head.headers.contains_key(metadata::GRPC_STATUS) {
        // Trailers-only response.
        shared.set_headers(head.headers.clone());
        shared.advance(CallPhase::ResponseReceived);
        return Status::from_trailers(head.headers);
    }
    if head.status != 200 {
        return Status::new(
            Code::from_http_status(head.status),
            format!("Bad gRPC response. HTTP status code: {}", head.status),
        );
    }
    match head.headers.get(metadata::CONTENT_TYPE) {
        Some(value) if metadata::is_grpc_content_type(value) => {}
        Some(value) => {
            return Status::internal(format!(
                "Bad gRPC response. Invalid content-type value: {value}"
            ));
        }
        None => {
            return Status::internal("Bad gRPC response. Response did not have a content-type header.");
        }
    }
    let encoding = head
        .headers
        .get(metadata::GRPC_ENCODING)
        .filter(|encoding| *encoding != "identity")
        .map(str::to_string);
    shared.set_headers(head.headers);

    let mut decoder = MessageDecoder::with_limit(settings.max_receive_message_size);
    loop {
        match body.next().await {
            Some(Ok(BodyFrame::Data(chunk))) => {
                decoder.feed(&chunk);
                loop {
                    let (message, compressed) = match decoder.decode() {
                        Ok(Some(decoded)) => decoded,
                        Ok(None) => break,
                        Err(e) => return e.into(),
                    };
                    if compressed {
                        return match &encoding {
                            None => Status::internal(
                                "Request did not include grpc-encoding value with compressed message.",
                            ),
                            Some(encoding) => Status::unimplemented(format!(
                                "Unsupported grpc-encoding value '{encoding}'."
                            )),
                        };
                    }
                    shared.observer.message_received(method);
                    // The reader may have gone away; keep draining for trailers.
                    let _ = messages.send(message).await;
                }
            }
            Some(Ok(BodyFrame::Trailers(trailers))) => {
                if let Err(e) = decoder.finish() {
                    return e.into();
                }
                shared.advance(CallPhase::ResponseReceived);
                return Status::from_trailers(trailers);
            }
            Some(Err(e)) => return e.into(),
            None => {
                if let Err(e) = decoder.finish() {
                    return e.into();
                }
                return Status::internal("No grpc-status found on response.");
            }
        }
    }
}

/// Build the request headers, running call credentials.
async fn request_headers(
    method: &MethodDescriptor,
    settings: &CallSettings,
    authority: &str,
    options: &CallOptions,
) -> Result<Metadata, Status> {
    let mut headers = Metadata::new();
    for (key, value) in options.headers().iter() {
        if !metadata::is_reserved(key) {
            headers.insert(key, value);
        }
    }

    let credentials: Vec<&CallCredentials> = settings
        .call_credentials
        .iter()
        .chain(options.credentials())
        .collect();
    if !credentials.is_empty() {
        if settings.scheme == Scheme::Https || settings.allow_insecure_call_credentials {
            let ctx = AuthContext {
                service_url: format!("{}://{}/{}", settings.scheme.as_str(), authority, method.service()),
                method: method.clone(),
            };
            for creds in credentials {
                creds.apply(&ctx, &mut headers).await?;
            }
        } else {
            warn!(method = %method, "call credentials not used on an insecure channel");
        }
    }

    headers.insert(metadata::CONTENT_TYPE, metadata::GRPC_CONTENT_TYPE);
    headers.insert(metadata::TE, "trailers");
    headers.insert(metadata::USER_AGENT, settings.user_agent.as_str());
    headers.insert(metadata::GRPC_ACCEPT_ENCODING, "identity");
    if let Some(timeout) = options
        .remaining()
        .and_then(|remaining| Timeout::from_duration(remaining).to_grpc_format())
    {
        headers.insert(metadata::GRPC_TIMEOUT, timeout);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodType;
    use crate::transport::{PeerStream, ResponseHead, TransportError, stream_pair};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Hands every opened stream's server half to the test.
    struct ScriptedTransport {
        peers: mpsc::UnboundedSender<PeerStream>,
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn open_stream(&self, head: RequestHead) -> Result<HttpStream, TransportError> {
            let (client, server) = stream_pair(head, 8);
            self.peers.send(server).map_err(|_| TransportError::Closed)?;
            Ok(client)
        }
    }

    fn settings() -> (Arc<CallSettings>, mpsc::UnboundedReceiver<PeerStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = CallSettings {
            scheme: Scheme::Http,
            authority: "localhost:50051".into(),
            transport: Arc::new(ScriptedTransport { peers: tx }),
            observer: Arc::new(TracingObserver),
            max_send_message_size: None,
            max_receive_message_size: frame::DEFAULT_MAX_RECEIVE_MESSAGE_SIZE,
            call_credentials: None,
            allow_insecure_call_credentials: false,
            user_agent: "grpc-rust-test".into(),
            message_buffer: 4,
        };
        (Arc::new(settings), rx)
    }

    fn method(kind: MethodType) -> MethodDescriptor {
        MethodDescriptor::new(kind, "test.Svc", "Do")
    }

    fn ok_head() -> ResponseHead {
        let mut headers = Metadata::new();
        headers.insert("content-type", "application/grpc");
        ResponseHead {
            status: 200,
            headers,
        }
    }

    fn trailers(code: Code, message: Option<&str>) -> Metadata {
        let mut md = Metadata::new();
        md.insert("grpc-status", code.as_u32().to_string());
        if let Some(message) = message {
            md.insert("grpc-message", crate::percent::encode(message));
        }
        md
    }

    #[tokio::test]
    async fn test_unary_request_headers_and_response() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::Unary),
            settings,
            None,
            CallOptions::new()
                .with_header("x-custom", "1")
                .with_header("te", "gzip")
                .with_timeout(Duration::from_secs(10)),
            CallRequest::Message(Bytes::from_static(b"ping")),
        );

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.head.path, "/test.Svc/Do");
        assert_eq!(peer.head.authority, "localhost:50051");
        assert_eq!(peer.head.headers.get("content-type"), Some("application/grpc"));
        assert_eq!(peer.head.headers.get_all("te").unwrap(), &["trailers".to_string()]);
        assert_eq!(peer.head.headers.get("x-custom"), Some("1"));
        let timeout = Timeout::parse(peer.head.headers.get("grpc-timeout").unwrap()).unwrap();
        assert!(timeout.as_duration() <= Duration::from_secs(10));

        let request = peer.body.next().await.unwrap();
        assert_eq!(&request[..], &frame::encode_message(b"ping")[..]);
        assert!(peer.body.next().await.is_none());

        peer.responder.send_head(ok_head()).unwrap();
        peer.responder
            .send_data(frame::encode_message(b"pong"))
            .await
            .unwrap();
        peer.responder
            .send_trailers(trailers(Code::Ok, None))
            .await
            .unwrap();

        assert_eq!(call.read().await.unwrap().unwrap(), Bytes::from_static(b"pong"));
        assert!(call.read().await.unwrap().is_none());
        assert!(call.wait_status().await.is_ok());
        assert_eq!(call.phase(), CallPhase::Completed);
        assert_eq!(
            call.response_headers().await.unwrap().get("content-type"),
            Some("application/grpc")
        );
    }

    #[tokio::test]
    async fn test_no_deadline_sends_no_timeout_header() {
        let (settings, mut peers) = settings();
        let _call = Call::start(
            method(MethodType::Unary),
            settings,
            Some("override:1"),
            CallOptions::new(),
            CallRequest::Message(Bytes::new()),
        );
        let peer = peers.recv().await.unwrap();
        assert!(!peer.head.headers.contains_key("grpc-timeout"));
        assert_eq!(peer.head.authority, "override:1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_never_sends() {
        let (settings, mut peers) = settings();
        let deadline = Instant::now();
        tokio::time::advance(Duration::from_millis(1)).await;

        let call = Call::start(
            method(MethodType::Unary),
            settings,
            None,
            CallOptions::new().with_deadline(deadline),
            CallRequest::Message(Bytes::from_static(b"x")),
        );

        let status = call.status().unwrap();
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert!(peers.try_recv().is_err());
        assert!(matches!(call.read().await, Err(s) if s.code() == Code::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_during_call() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::ServerStreaming),
            settings,
            None,
            CallOptions::new().with_timeout(Duration::from_millis(100)),
            CallRequest::Message(Bytes::new()),
        );
        let peer = peers.recv().await.unwrap();

        let status = call.wait_status().await;
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(status.message(), Some(DEADLINE_EXCEEDED));
        // The stream is reset towards the server.
        peer.reset.cancelled().await;
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let (settings, mut peers) = settings();
        let token = CancellationToken::new();
        let call = Call::start(
            method(MethodType::DuplexStreaming),
            settings,
            None,
            CallOptions::new().with_cancellation(token.clone()),
            CallRequest::Stream,
        );
        let _peer = peers.recv().await.unwrap();

        token.cancel();
        let status = call.wait_status().await;
        assert_eq!(status.code(), Code::Cancelled);
        assert!(matches!(call.read().await, Err(s) if s.code() == Code::Cancelled));
        assert_eq!(call.write(Bytes::new()).await.unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_deadline_race_is_deterministic() {
        let (settings, _peers) = settings();
        let token = CancellationToken::new();
        let call = Call::start(
            method(MethodType::Unary),
            settings,
            None,
            CallOptions::new()
                .with_timeout(Duration::from_millis(50))
                .with_cancellation(token.clone()),
            CallRequest::Message(Bytes::new()),
        );

        // Both fire before the driver observes either.
        token.cancel();
        tokio::time::advance(Duration::from_millis(100)).await;

        let status = call.wait_status().await;
        assert_eq!(status.code(), Code::Cancelled);
        // A later trigger never overwrites the recorded status.
        call.abort(Status::internal("late"));
        assert_eq!(call.status().unwrap().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_grpc_status_is_internal() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::Unary),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Message(Bytes::new()),
        );
        let mut peer = peers.recv().await.unwrap();
        peer.responder.send_head(ok_head()).unwrap();
        peer.responder.send_trailers(Metadata::new()).await.unwrap();

        let status = call.wait_status().await;
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), Some("No grpc-status found on response."));
    }

    #[tokio::test]
    async fn test_stream_ends_without_trailers() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::Unary),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Message(Bytes::new()),
        );
        let mut peer = peers.recv().await.unwrap();
        peer.responder.send_head(ok_head()).unwrap();
        let encoded = frame::encode_message(b"partial message");
        peer.responder.send_data(encoded.slice(..8)).await.unwrap();
        drop(peer);

        let status = call.wait_status().await;
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().unwrap().contains("stream truncated"));
    }

    #[tokio::test]
    async fn test_trailers_only_response() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::Unary),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Message(Bytes::new()),
        );
        let mut peer = peers.recv().await.unwrap();
        let mut head = ok_head();
        head.headers.extend(trailers(Code::NotFound, Some("no such key")));
        peer.responder.send_head(head).unwrap();

        let status = call.wait_status().await;
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), Some("no such key"));
        assert!(call.response_headers().await.unwrap().contains_key("grpc-status"));
    }

    #[tokio::test]
    async fn test_http_error_and_bad_content_type() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::Unary),
            settings.clone(),
            None,
            CallOptions::new(),
            CallRequest::Message(Bytes::new()),
        );
        let mut peer = peers.recv().await.unwrap();
        peer.responder
            .send_head(ResponseHead {
                status: 503,
                headers: Metadata::new(),
            })
            .unwrap();
        assert_eq!(call.wait_status().await.code(), Code::Unavailable);

        let call = Call::start(
            method(MethodType::Unary),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Message(Bytes::new()),
        );
        let mut peer = peers.recv().await.unwrap();
        let mut headers = Metadata::new();
        headers.insert("content-type", "text/html");
        peer.responder
            .send_head(ResponseHead {
                status: 200,
                headers,
            })
            .unwrap();
        let status = call.wait_status().await;
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().unwrap().contains("text/html"));
    }

    #[tokio::test]
    async fn test_messages_before_error_are_delivered() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::ServerStreaming),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Message(Bytes::new()),
        );
        let mut peer = peers.recv().await.unwrap();
        peer.responder.send_head(ok_head()).unwrap();
        peer.responder
            .send_data(frame::encode_message(b"one"))
            .await
            .unwrap();
        peer.responder
            .send_trailers(trailers(Code::Aborted, Some("stopped")))
            .await
            .unwrap();

        assert_eq!(call.wait_status().await.code(), Code::Aborted);
        assert_eq!(call.read().await.unwrap().unwrap(), Bytes::from_static(b"one"));
        let err = call.read().await.unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
        assert_eq!(err.message(), Some("stopped"));
    }

    #[tokio::test]
    async fn test_compressed_message_without_encoding() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::Unary),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Message(Bytes::new()),
        );
        let mut peer = peers.recv().await.unwrap();
        peer.responder.send_head(ok_head()).unwrap();
        peer.responder
            .send_data(frame::encode_message_with_compression(b"zz", true))
            .await
            .unwrap();
        assert_eq!(call.wait_status().await.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_streaming_writes_and_half_close() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::ClientStreaming),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Stream,
        );

        call.write(Bytes::from_static(b"a")).await.unwrap();
        call.write(Bytes::from_static(b"b")).await.unwrap();
        call.complete_request();
        call.complete_request();
        assert!(call.is_request_completed());

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(&peer.body.next().await.unwrap()[..], &frame::encode_message(b"a")[..]);
        assert_eq!(&peer.body.next().await.unwrap()[..], &frame::encode_message(b"b")[..]);
        assert!(peer.body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_complete_before_stream_opens() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::ClientStreaming),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Stream,
        );
        call.complete_request();

        let mut peer = peers.recv().await.unwrap();
        assert!(peer.body.next().await.is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "request stream has already been completed")]
    async fn test_write_after_complete_panics() {
        let (settings, _peers) = settings();
        let call = Call::start(
            method(MethodType::ClientStreaming),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Stream,
        );
        call.complete_request();
        let _ = call.write(Bytes::new()).await;
    }

    #[tokio::test]
    async fn test_write_after_ok_completion_is_failed_precondition() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::DuplexStreaming),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Stream,
        );
        let mut peer = peers.recv().await.unwrap();
        peer.responder.send_head(ok_head()).unwrap();
        peer.responder.send_trailers(trailers(Code::Ok, None)).await.unwrap();
        assert!(call.wait_status().await.is_ok());

        let err = call.write(Bytes::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_send_size_limit() {
        let (settings, _peers) = settings();
        let mut limited = CallSettings {
            max_send_message_size: Some(2),
            ..Arc::try_unwrap(settings).ok().unwrap()
        };
        limited.message_buffer = 1;
        let call = Call::start(
            method(MethodType::ClientStreaming),
            Arc::new(limited),
            None,
            CallOptions::new(),
            CallRequest::Stream,
        );
        let err = call.write(Bytes::from_static(b"abc")).await.unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert!(call.status().is_none());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_cancels() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::ServerStreaming),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Message(Bytes::new()),
        );
        let peer = peers.recv().await.unwrap();
        drop(call);
        peer.reset.cancelled().await;
    }

    #[tokio::test]
    async fn test_failed_call() {
        let call = Call::failed(method(MethodType::Unary), Status::internal("bad request"));
        assert_eq!(call.phase(), CallPhase::Completed);
        assert_eq!(call.read().await.unwrap_err().code(), Code::Internal);
        assert_eq!(call.response_headers().await.unwrap_err().code(), Code::Internal);
    }

    /// Fill the request buffer, then park one more write on it.
    async fn blocked_writer(call: &Call) -> tokio::task::JoinHandle<Result<(), Status>> {
        for _ in 0..8 {
            call.write(Bytes::from_static(b"x")).await.unwrap();
        }
        let writer = call.clone();
        let blocked = tokio::spawn(async move { writer.write(Bytes::from_static(b"x")).await });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());
        blocked
    }

    #[tokio::test]
    #[should_panic(expected = "a write is already in progress")]
    async fn test_concurrent_write_panics() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::ClientStreaming),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Stream,
        );
        let _peer = peers.recv().await.unwrap();
        let _blocked = blocked_writer(&call).await;
        let _ = call.write(Bytes::from_static(b"y")).await;
    }

    #[tokio::test]
    #[should_panic(expected = "cannot complete the request stream while a write is in progress")]
    async fn test_complete_during_write_panics() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::ClientStreaming),
            settings,
            None,
            CallOptions::new(),
            CallRequest::Stream,
        );
        let _peer = peers.recv().await.unwrap();
        let _blocked = blocked_writer(&call).await;
        call.complete_request();
    }

    #[tokio::test]
    async fn test_non_ascii_content_type_is_internal() {
        let (settings, mut peers) = settings();
        let call = Call::start(
            method(MethodType::Unary),
            settings,
            None,
            CallOptions::new().with_timeout(Duration::from_secs(2)),
            CallRequest::Message(Bytes::new()),
        );
        let mut peer = peers.recv().await.unwrap();
        let mut headers = Metadata::new();
        headers.insert("content-type", "application/grp\u{e9}");
        peer.responder
            .send_head(ResponseHead {
                status: 200,
                headers,
            })
            .unwrap();

        let status = call.wait_status().await;
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().unwrap().contains("content-type"));
    }

    struct PanickingTransport;

    #[async_trait]
    impl HttpTransport for PanickingTransport {
        async fn open_stream(&self, _head: RequestHead) -> Result<HttpStream, TransportError> {
            panic!("transport bug");
        }
    }

    #[tokio::test]
    async fn test_driver_panic_completes_call() {
        let (settings, _peers) = settings();
        let settings = CallSettings {
            transport: Arc::new(PanickingTransport),
            ..Arc::try_unwrap(settings).ok().unwrap()
        };
        let call = Call::start(
            method(MethodType::ServerStreaming),
            Arc::new(settings),
            None,
            CallOptions::new(),
            CallRequest::Message(Bytes::new()),
        );

        let status = call.read().await.unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), Some(DRIVER_PANICKED));
        assert_eq!(call.phase(), CallPhase::Completed);
    }
}
