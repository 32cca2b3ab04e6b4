//! In-process gRPC method dispatch.
//!
//! A [`Router`] maps method paths to typed handlers and serves the server
//! half of a stream opened through [`stream_pair`](crate::transport::stream_pair).
//! Handlers see decoded requests and write typed responses; the router
//! takes care of framing, response headers, trailers and deadlines.

use crate::cancel::CancellationToken;
use crate::frame::{self, DEFAULT_MAX_RECEIVE_MESSAGE_SIZE, MessageDecoder};
use crate::metadata::{self, Metadata, Timeout};
use crate::method::{Marshaller, Method, MethodType};
use crate::serialization::SerializationContext;
use crate::status::Status;
use crate::transport::{PeerBody, PeerStream, Responder, ResponseHead};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Per-call state visible to a handler.
#[derive(Clone)]
pub struct ServerCallContext {
    path: Arc<str>,
    headers: Arc<Metadata>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    response_headers: Arc<Mutex<Metadata>>,
    trailers: Arc<Mutex<Metadata>>,
}

impl ServerCallContext {
    pub fn method(&self) -> &str {
        &self.path
    }

    /// Request headers sent by the client.
    pub fn request_headers(&self) -> &Metadata {
        &self.headers
    }

    /// Deadline derived from the `grpc-timeout` header.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fires when the client resets the stream.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Add a response header. Ignored once the first message was written.
    pub fn add_response_header(&self, key: impl Into<String>, value: impl Into<String>) {
        self.response_headers.lock().insert(key, value);
    }

    /// Add a trailer sent alongside the final status.
    pub fn add_trailer(&self, key: impl Into<String>, value: impl Into<String>) {
        self.trailers.lock().insert(key, value);
    }
}

/// Incoming request messages.
pub struct RequestStream<T> {
    body: PeerBody,
    decoder: MessageDecoder,
    marshaller: Marshaller<T>,
    done: bool,
}

impl<T: 'static> RequestStream<T> {
    fn new(body: PeerBody, marshaller: Marshaller<T>, limit: usize) -> Self {
        Self {
            body,
            decoder: MessageDecoder::with_limit(limit),
            marshaller,
            done: false,
        }
    }

    /// The next request message, or `Ok(None)` once the client half-closed.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        loop {
            match self.decoder.decode()? {
                Some((_, true)) => {
                    return Err(Status::internal(
                        "Request did not include grpc-encoding value with compressed message.",
                    ));
                }
                Some((payload, false)) => return self.marshaller.deserialize(payload).map(Some),
                None if self.done => {
                    self.decoder.finish()?;
                    return Ok(None);
                }
                None => match self.body.next().await {
                    Some(chunk) => self.decoder.feed(&chunk),
                    None => self.done = true,
                },
            }
        }
    }
}

struct ResponseSink {
    responder: Option<Responder>,
    headers: Arc<Mutex<Metadata>>,
}

impl ResponseSink {
    fn send_headers_if_needed(&mut self) -> Result<(), Status> {
        let Some(responder) = self.responder.as_mut() else {
            return Err(Status::failed_precondition("response already completed"));
        };
        if !responder.head_sent() {
            let mut headers = std::mem::take(&mut *self.headers.lock());
            headers.insert(metadata::CONTENT_TYPE, metadata::GRPC_CONTENT_TYPE);
            responder.send_head(ResponseHead {
                status: 200,
                headers,
            })?;
        }
        Ok(())
    }

    async fn send_message(&mut self, payload: &[u8]) -> Result<(), Status> {
        self.send_headers_if_needed()?;
        if let Some(responder) = self.responder.as_mut() {
            responder.send_data(frame::encode_message(payload)).await?;
        }
        Ok(())
    }

    /// Send the final status, as a trailers-only response when no message
    /// was written.
    async fn finish(&mut self, status: Status) {
        let Some(mut responder) = self.responder.take() else {
            return;
        };
        let trailers = status.to_trailers();
        let result = if responder.head_sent() {
            responder.send_trailers(trailers).await
        } else {
            let mut headers = std::mem::take(&mut *self.headers.lock());
            headers.insert(metadata::CONTENT_TYPE, metadata::GRPC_CONTENT_TYPE);
            headers.extend(trailers);
            responder.send_head(ResponseHead {
                status: 200,
                headers,
            })
        };
        if let Err(e) = result {
            debug!(error = %e, "failed to send final status");
        }
    }
}

/// Writes response messages for server-streaming and duplex handlers.
pub struct ServerStreamWriter<T> {
    sink: SharedSink,
    marshaller: Marshaller<T>,
}

impl<T: 'static> ServerStreamWriter<T> {
    /// Serialize `message` now and send it once the stream accepts it.
    /// The returned future does not borrow `message`.
    pub fn write(&self, message: &T) -> impl Future<Output = Result<(), Status>> + Send + use<T> {
        let payload = self
            .marshaller
            .serialize(message, &mut SerializationContext::new());
        let sink = self.sink.clone();
        async move { sink.lock().await.send_message(&payload?).await }
    }
}

type SharedSink = Arc<tokio::sync::Mutex<ResponseSink>>;

type Handler =
    Arc<dyn Fn(ServerCallContext, PeerBody, SharedSink, usize) -> BoxFuture<'static, Status> + Send + Sync>;

#[derive(Clone)]
struct Route {
    kind: MethodType,
    handler: Handler,
}

/// Method path to handler registry.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Route>,
    max_receive_message_size: Option<usize>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest accepted request message. Defaults to 4 MiB.
    pub fn max_receive_message_size(mut self, limit: usize) -> Self {
        self.max_receive_message_size = Some(limit);
        self
    }

    fn route(mut self, path: &str, kind: MethodType, handler: Handler) -> Self {
        self.routes.insert(path.to_string(), Route { kind, handler });
        self
    }

    pub fn unary<Req, Resp, F, Fut>(self, method: &Method<Req, Resp>, handler: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Req, ServerCallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let request = method.request_marshaller().clone();
        let response = method.response_marshaller().clone();
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(
            move |ctx: ServerCallContext, body: PeerBody, sink: SharedSink, limit: usize| -> BoxFuture<'static, Status> {
                let mut requests = RequestStream::new(body, request.clone(), limit);
                let response = response.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let message = match single_request(&mut requests).await {
                        Ok(message) => message,
                        Err(status) => return status,
                    };
                    match handler(message, ctx).await {
                        Ok(reply) => write_single(&sink, &response, reply).await,
                        Err(status) => status,
                    }
                })
            },
        );
        self.route(method.descriptor().path(), MethodType::Unary, erased)
    }

    pub fn client_streaming<Req, Resp, F, Fut>(self, method: &Method<Req, Resp>, handler: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(RequestStream<Req>, ServerCallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let request = method.request_marshaller().clone();
        let response = method.response_marshaller().clone();
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(
            move |ctx: ServerCallContext, body: PeerBody, sink: SharedSink, limit: usize| -> BoxFuture<'static, Status> {
                let requests = RequestStream::new(body, request.clone(), limit);
                let response = response.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    match handler(requests, ctx).await {
                        Ok(reply) => write_single(&sink, &response, reply).await,
                        Err(status) => status,
                    }
                })
            },
        );
        self.route(method.descriptor().path(), MethodType::ClientStreaming, erased)
    }

    pub fn server_streaming<Req, Resp, F, Fut>(self, method: &Method<Req, Resp>, handler: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Req, ServerStreamWriter<Resp>, ServerCallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let request = method.request_marshaller().clone();
        let response = method.response_marshaller().clone();
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(
            move |ctx: ServerCallContext, body: PeerBody, sink: SharedSink, limit: usize| -> BoxFuture<'static, Status> {
                let mut requests = RequestStream::new(body, request.clone(), limit);
                let writer = ServerStreamWriter {
                    sink,
                    marshaller: response.clone(),
                };
                let handler = handler.clone();
                Box::pin(async move {
                    let message = match single_request(&mut requests).await {
                        Ok(message) => message,
                        Err(status) => return status,
                    };
                    status_of(handler(message, writer, ctx).await)
                })
            },
        );
        self.route(method.descriptor().path(), MethodType::ServerStreaming, erased)
    }

    pub fn duplex<Req, Resp, F, Fut>(self, method: &Method<Req, Resp>, handler: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(RequestStream<Req>, ServerStreamWriter<Resp>, ServerCallContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let request = method.request_marshaller().clone();
        let response = method.response_marshaller().clone();
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(
            move |ctx: ServerCallContext, body: PeerBody, sink: SharedSink, limit: usize| -> BoxFuture<'static, Status> {
                let requests = RequestStream::new(body, request.clone(), limit);
                let writer = ServerStreamWriter {
                    sink,
                    marshaller: response.clone(),
                };
                let handler = handler.clone();
                Box::pin(async move { status_of(handler(requests, writer, ctx).await) })
            },
        );
        self.route(method.descriptor().path(), MethodType::DuplexStreaming, erased)
    }

    /// Kind of the method registered at `path`.
    pub fn method_kind(&self, path: &str) -> Option<MethodType> {
        self.routes.get(path).map(|route| route.kind)
    }

    /// Serve one request stream to completion.
    pub async fn serve(&self, stream: PeerStream) {
        let PeerStream {
            head,
            body,
            responder,
            reset,
        } = stream;

        let response_headers = Arc::new(Mutex::new(Metadata::new()));
        let sink = Arc::new(tokio::sync::Mutex::new(ResponseSink {
            responder: Some(responder),
            headers: response_headers.clone(),
        }));

        let Some(route) = self.routes.get(&head.path) else {
            debug!(path = %head.path, "unknown method");
            let status = Status::unimplemented(format!("Method is unimplemented: {}", head.path));
            sink.lock().await.finish(status).await;
            return;
        };

        match head.headers.get(metadata::CONTENT_TYPE) {
            Some(value) if metadata::is_grpc_content_type(value) => {}
            other => {
                let status = Status::internal(format!(
                    "Content-Type '{}' is not supported.",
                    other.unwrap_or_default()
                ));
                sink.lock().await.finish(status).await;
                return;
            }
        }

        let deadline = head
            .headers
            .get(metadata::GRPC_TIMEOUT)
            .and_then(Timeout::parse)
            .and_then(|timeout| Instant::now().checked_add(timeout.as_duration()));

        let trailers = Arc::new(Mutex::new(Metadata::new()));
        let ctx = ServerCallContext {
            path: Arc::from(head.path.as_str()),
            headers: Arc::new(head.headers),
            deadline,
            cancellation: reset.clone(),
            response_headers,
            trailers: trailers.clone(),
        };
        trace!(path = %ctx.path, "serving call");

        let limit = self
            .max_receive_message_size
            .unwrap_or(DEFAULT_MAX_RECEIVE_MESSAGE_SIZE);
        let handled = (route.handler)(ctx, body, sink.clone(), limit);

        let deadline_elapsed = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        let status = tokio::select! {
            biased;
            _ = reset.cancelled() => {
                debug!(path = %head.path, "client reset the stream");
                return;
            }
            _ = deadline_elapsed => Status::deadline_exceeded("Deadline Exceeded"),
            status = handled => status,
        };

        let custom = std::mem::take(&mut *trailers.lock());
        let mut merged = status.trailers().clone();
        merged.extend(custom);
        sink.lock().await.finish(status.with_trailers(merged)).await;
    }
}

async fn single_request<T: 'static>(requests: &mut RequestStream<T>) -> Result<T, Status> {
    let Some(message) = requests.message().await? else {
        return Err(Status::internal("Request stream ended before a message was received."));
    };
    if requests.message().await?.is_some() {
        return Err(Status::internal("Received more than one request message for a unary request."));
    }
    Ok(message)
}

async fn write_single<T: 'static>(
    sink: &tokio::sync::Mutex<ResponseSink>,
    marshaller: &Marshaller<T>,
    reply: T,
) -> Status {
    let payload = match marshaller.serialize(&reply, &mut SerializationContext::new()) {
        Ok(payload) => payload,
        Err(status) => return status,
    };
    match sink.lock().await.send_message(&payload).await {
        Ok(()) => Status::ok(),
        Err(status) => status,
    }
}

fn status_of(result: Result<(), Status>) -> Status {
    result.err().unwrap_or_else(Status::ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BodyFrame, RequestHead, Scheme, stream_pair};
    use crate::Code;
    use crate::method::MarshalError;
    use bytes::Bytes;

    fn echo() -> Method<String, String> {
        Method::new(
            MethodType::Unary,
            "test.Echo",
            "Say",
            Marshaller::utf8(),
            Marshaller::utf8(),
        )
    }

    fn head(path: &str) -> RequestHead {
        let mut headers = Metadata::new();
        headers.insert(metadata::CONTENT_TYPE, metadata::GRPC_CONTENT_TYPE);
        RequestHead {
            scheme: Scheme::Http,
            authority: "localhost".into(),
            path: path.into(),
            headers,
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_trailers_only() {
        let router = Router::new().unary(&echo(), |req: String, _| async move { Ok::<_, Status>(req) });
        let (client, server) = stream_pair(head("/test.Echo/Missing"), 4);
        router.serve(server).await;

        let (head, _) = client.response.recv().await.unwrap();
        let status = Status::from_trailers(head.headers);
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), Some("Method is unimplemented: /test.Echo/Missing"));
    }

    #[tokio::test]
    async fn test_unary_response_and_trailers() {
        let router = Router::new().unary(&echo(), |req: String, ctx: ServerCallContext| async move {
            ctx.add_trailer("x-served-by", "router");
            Ok::<_, Status>(req.to_uppercase())
        });
        let (mut client, server) = stream_pair(head("/test.Echo/Say"), 4);
        client.body.send(frame::encode_message(b"hi")).await.unwrap();
        client.body.finish();
        router.serve(server).await;

        let (head, mut body) = client.response.recv().await.unwrap();
        assert_eq!(head.status, 200);
        let Some(Ok(BodyFrame::Data(data))) = body.next().await else {
            panic!("expected data");
        };
        assert_eq!(data, frame::encode_message(b"HI"));
        let Some(Ok(BodyFrame::Trailers(trailers))) = body.next().await else {
            panic!("expected trailers");
        };
        assert_eq!(trailers.get("x-served-by"), Some("router"));
        assert!(Status::from_trailers(trailers).is_ok());
    }

    #[tokio::test]
    async fn test_missing_unary_request() {
        let router = Router::new().unary(&echo(), |req: String, _| async move { Ok::<_, Status>(req) });
        let (client, server) = stream_pair(head("/test.Echo/Say"), 4);
        drop(client.body);
        router.serve(server).await;

        let (head, _) = client.response.recv().await.unwrap();
        assert_eq!(Status::from_trailers(head.headers).code(), Code::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_deadline() {
        let router = Router::new().unary(&echo(), |_: String, _| async move {
            std::future::pending::<()>().await;
            Ok::<_, Status>(String::new())
        });
        let mut request = head("/test.Echo/Say");
        request.headers.insert(metadata::GRPC_TIMEOUT, "50m");
        let (mut client, server) = stream_pair(request, 4);
        client.body.send(frame::encode_message(b"x")).await.unwrap();
        client.body.finish();
        router.serve(server).await;

        let (head, _) = client.response.recv().await.unwrap();
        assert_eq!(Status::from_trailers(head.headers).code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_request_stream_rejects_compressed() {
        let method: Method<Bytes, Bytes> = Method::new(
            MethodType::ClientStreaming,
            "test.Sum",
            "Add",
            Marshaller::bytes(),
            Marshaller::bytes(),
        );
        let router = Router::new().client_streaming(&method, |mut requests: RequestStream<Bytes>, _| async move {
            while requests.message().await?.is_some() {}
            Ok::<_, Status>(Bytes::new())
        });
        let (mut client, server) = stream_pair(head("/test.Sum/Add"), 4);
        client
            .body
            .send(frame::encode_message_with_compression(b"z", true))
            .await
            .unwrap();
        client.body.finish();
        router.serve(server).await;

        let (head, _) = client.response.recv().await.unwrap();
        assert_eq!(Status::from_trailers(head.headers).code(), Code::Internal);
    }

    /// A response type that can move between threads but not be shared.
    struct Tally(std::cell::Cell<u32>);

    fn tally_marshaller() -> Marshaller<Tally> {
        Marshaller::new(
            |tally: &Tally| tally.0.get().to_string().into_bytes(),
            |payload: Bytes| {
                std::str::from_utf8(&payload)
                    .ok()
                    .and_then(|text| text.parse().ok())
                    .map(|n| Tally(std::cell::Cell::new(n)))
                    .ok_or_else(|| MarshalError::new("not a number"))
            },
        )
    }

    #[tokio::test]
    async fn test_unsync_response_types() {
        let unary: Method<String, Tally> =
            Method::new(MethodType::Unary, "test.Tally", "Count", Marshaller::utf8(), tally_marshaller());
        let stream: Method<String, Tally> = Method::new(
            MethodType::ServerStreaming,
            "test.Tally",
            "Each",
            Marshaller::utf8(),
            tally_marshaller(),
        );
        let router = Router::new()
            .unary(&unary, |req: String, _| async move {
                Ok::<_, Status>(Tally(std::cell::Cell::new(req.len() as u32)))
            })
            .server_streaming(&stream, |req: String, writer: ServerStreamWriter<Tally>, _| async move {
                for n in 0..req.len() as u32 {
                    let tally = Tally(std::cell::Cell::new(n));
                    writer.write(&tally).await?;
                }
                Ok::<_, Status>(())
            });

        let (mut client, server) = stream_pair(head("/test.Tally/Count"), 4);
        client.body.send(frame::encode_message(b"abc")).await.unwrap();
        client.body.finish();
        router.serve(server).await;

        let (_, mut body) = client.response.recv().await.unwrap();
        let Some(Ok(BodyFrame::Data(data))) = body.next().await else {
            panic!("expected data");
        };
        assert_eq!(data, frame::encode_message(b"3"));

        let (mut client, server) = stream_pair(head("/test.Tally/Each"), 4);
        client.body.send(frame::encode_message(b"ab")).await.unwrap();
        client.body.finish();
        router.serve(server).await;

        let (_, mut body) = client.response.recv().await.unwrap();
        for expected in [b"0", b"1"] {
            let Some(Ok(BodyFrame::Data(data))) = body.next().await else {
                panic!("expected data");
            };
            assert_eq!(data, frame::encode_message(expected));
        }
    }
}
