//! The HTTP/2 transport seam.
//!
//! The call engine never speaks HTTP/2 itself. It opens one stream per call
//! through [`HttpTransport`], writes framed request bytes into the
//! [`RequestBody`], and reads the response head, body chunks and trailers
//! back. Transports bridge the server half of a [`stream_pair`] to a real
//! connection, or serve it in process.

use crate::cancel::CancellationToken;
use crate::metadata::Metadata;
use crate::status::Status;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// HTTP/2 `CANCEL` error code.
pub const RESET_CANCEL: u32 = 0x8;
/// HTTP/2 `REFUSED_STREAM` error code.
pub const RESET_REFUSED_STREAM: u32 = 0x7;
/// HTTP/2 `ENHANCE_YOUR_CALM` error code.
pub const RESET_ENHANCE_YOUR_CALM: u32 = 0xb;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("connection refused")]
    Refused,
    #[error("connection closed")]
    Closed,
    #[error("stream reset with code {0:#x}")]
    Reset(u32),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Reset(RESET_CANCEL) => Status::cancelled(err.to_string()),
            TransportError::Reset(RESET_REFUSED_STREAM) => Status::unavailable(err.to_string()),
            TransportError::Reset(RESET_ENHANCE_YOUR_CALM) => {
                Status::resource_exhausted(err.to_string())
            }
            TransportError::Reset(_) | TransportError::Protocol(_) => Status::internal(err.to_string()),
            TransportError::Connect(_)
            | TransportError::Refused
            | TransportError::Closed
            | TransportError::Io(_) => Status::unavailable(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A parsed channel address such as `http://localhost:50051`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Parse an absolute `http` or `https` address. A missing port defaults
    /// to 80 or 443. Paths, queries and fragments are rejected.
    pub fn parse(address: &str) -> Result<Self, String> {
        let (scheme, rest) = address
            .split_once("://")
            .ok_or_else(|| format!("address '{address}' has no scheme"))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(format!("unsupported scheme '{other}' in '{address}'")),
        };
        let authority = rest.strip_suffix('/').unwrap_or(rest);
        if authority.is_empty() || authority.contains(['/', '?', '#', '@']) {
            return Err(format!("address '{address}' must be scheme://host[:port]"));
        }

        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            let (host, tail) = stripped
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 literal in '{address}'"))?;
            let port = match tail {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(|| {
                    format!("unexpected '{tail}' after IPv6 literal in '{address}'")
                })?),
            };
            (format!("[{host}]"), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), Some(port)),
                None => (authority.to_string(), None),
            }
        };
        if host.is_empty() {
            return Err(format!("address '{address}' has no host"));
        }

        let port = match port {
            Some(port) => port
                .parse()
                .map_err(|_| format!("invalid port '{port}' in '{address}'"))?,
            None => match scheme {
                Scheme::Http => 80,
                Scheme::Https => 443,
            },
        };

        Ok(Self { scheme, host, port })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// `host:port` as sent in `:authority`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Byte stream returned by a [`Connector`].
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// Callback that opens the raw connection for a transport, for example a
/// Unix domain socket in place of TCP.
pub type Connector =
    Arc<dyn Fn(&Endpoint) -> BoxFuture<'static, io::Result<Box<dyn AsyncIo>>> + Send + Sync>;

/// Request line and headers for one stream.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub scheme: Scheme,
    pub authority: String,
    pub path: String,
    pub headers: Metadata,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Metadata,
}

#[derive(Debug)]
pub enum BodyFrame {
    Data(Bytes),
    Trailers(Metadata),
}

/// An HTTP/2 transport able to open request streams.
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    async fn open_stream(&self, head: RequestHead) -> Result<HttpStream, TransportError>;

    /// Release connections. Streams opened afterwards fail.
    fn close(&self) {}
}

/// Creates the transport for a channel.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        endpoint: &Endpoint,
        connector: Option<Connector>,
    ) -> Result<Arc<dyn HttpTransport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&Endpoint, Option<Connector>) -> Result<Arc<dyn HttpTransport>, TransportError>
        + Send
        + Sync,
{
    fn create(
        &self,
        endpoint: &Endpoint,
        connector: Option<Connector>,
    ) -> Result<Arc<dyn HttpTransport>, TransportError> {
        self(endpoint, connector)
    }
}

type ResponseResult = Result<(ResponseHead, ResponseBody), TransportError>;

/// Client half of an open stream.
pub struct HttpStream {
    pub body: RequestBody,
    pub response: PendingResponse,
    pub reset: StreamReset,
}

/// Server half of an open stream.
pub struct PeerStream {
    pub head: RequestHead,
    pub body: PeerBody,
    pub responder: Responder,
    /// Fires when the client abandons the stream.
    pub reset: CancellationToken,
}

/// Create a connected client/server stream pair with `capacity` chunks of
/// buffering in each direction.
pub fn stream_pair(head: RequestHead, capacity: usize) -> (HttpStream, PeerStream) {
    let capacity = capacity.max(1);
    let (body_tx, body_rx) = mpsc::channel(capacity);
    let (head_tx, head_rx) = oneshot::channel();
    let (frames_tx, frames_rx) = mpsc::channel(capacity);
    let reset = CancellationToken::new();

    let client = HttpStream {
        body: RequestBody { tx: body_tx },
        response: PendingResponse { rx: head_rx },
        reset: StreamReset {
            token: reset.clone(),
        },
    };
    let server = PeerStream {
        head,
        body: PeerBody { rx: body_rx },
        responder: Responder {
            head: Some(head_tx),
            frames_tx,
            frames_rx: Some(frames_rx),
        },
        reset,
    };
    (client, server)
}

/// Writes request body bytes. Dropping it ends the request stream.
pub struct RequestBody {
    tx: mpsc::Sender<Bytes>,
}

impl RequestBody {
    /// Send a chunk, waiting for buffer space.
    pub async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.tx.send(data).await.map_err(|_| TransportError::Closed)
    }

    /// End the request stream.
    pub fn finish(self) {}
}

/// Resolves to the response head once the server starts responding.
pub struct PendingResponse {
    rx: oneshot::Receiver<ResponseResult>,
}

impl PendingResponse {
    pub async fn recv(self) -> ResponseResult {
        self.rx.await.map_err(|_| TransportError::Closed)?
    }
}

/// Response body chunks followed by trailers.
pub struct ResponseBody {
    rx: mpsc::Receiver<Result<BodyFrame, TransportError>>,
}

impl ResponseBody {
    /// `None` once the server closed the stream.
    pub async fn next(&mut self) -> Option<Result<BodyFrame, TransportError>> {
        self.rx.recv().await
    }
}

/// Lets the client abort its stream.
#[derive(Clone)]
pub struct StreamReset {
    token: CancellationToken,
}

impl StreamReset {
    pub fn reset(&self) {
        self.token.cancel();
    }
}

/// Server side view of the request body.
pub struct PeerBody {
    rx: mpsc::Receiver<Bytes>,
}

impl PeerBody {
    /// `None` at end of stream or when the client went away.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Server side response writer.
pub struct Responder {
    head: Option<oneshot::Sender<ResponseResult>>,
    frames_tx: mpsc::Sender<Result<BodyFrame, TransportError>>,
    frames_rx: Option<mpsc::Receiver<Result<BodyFrame, TransportError>>>,
}

impl Responder {
    pub fn head_sent(&self) -> bool {
        self.head.is_none()
    }

    pub fn send_head(&mut self, head: ResponseHead) -> Result<(), TransportError> {
        let (tx, rx) = match (self.head.take(), self.frames_rx.take()) {
            (Some(tx), Some(rx)) => (tx, rx),
            _ => return Err(TransportError::Protocol("response head already sent".into())),
        };
        tx.send(Ok((head, ResponseBody { rx })))
            .map_err(|_| TransportError::Closed)
    }

    pub async fn send_data(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.head_sent() {
            return Err(TransportError::Protocol("data sent before response head".into()));
        }
        self.frames_tx
            .send(Ok(BodyFrame::Data(data)))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Send trailers and close the stream.
    pub async fn send_trailers(self, trailers: Metadata) -> Result<(), TransportError> {
        if !self.head_sent() {
            return Err(TransportError::Protocol("trailers sent before response head".into()));
        }
        self.frames_tx
            .send(Ok(BodyFrame::Trailers(trailers)))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Abort the stream with a transport error.
    pub fn fail(mut self, err: TransportError) {
        match self.head.take() {
            Some(tx) => {
                let _ = tx.send(Err(err));
            }
            None => {
                let _ = self.frames_tx.try_send(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    fn head() -> RequestHead {
        RequestHead {
            scheme: Scheme::Http,
            authority: "localhost:80".into(),
            path: "/svc/Method".into(),
            headers: Metadata::new(),
        }
    }

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("http://localhost:50051").unwrap();
        assert_eq!(ep.scheme(), Scheme::Http);
        assert_eq!(ep.host(), "localhost");
        assert_eq!(ep.port(), 50051);
        assert_eq!(ep.authority(), "localhost:50051");
        assert!(!ep.is_secure());

        let ep = Endpoint::parse("HTTPS://example.com/").unwrap();
        assert!(ep.is_secure());
        assert_eq!(ep.port(), 443);

        let ep = Endpoint::parse("http://[::1]:8080").unwrap();
        assert_eq!(ep.host(), "[::1]");
        assert_eq!(ep.port(), 8080);
        assert_eq!(ep.to_string(), "http://[::1]:8080");
    }

    #[test]
    fn test_endpoint_parse_errors() {
        assert!(Endpoint::parse("localhost:50051").is_err());
        assert!(Endpoint::parse("dns:///localhost").is_err());
        assert!(Endpoint::parse("http://").is_err());
        assert!(Endpoint::parse("http://host/path").is_err());
        assert!(Endpoint::parse("http://host:notaport").is_err());
        assert!(Endpoint::parse("http://[::1").is_err());
        assert!(Endpoint::parse("http://[::1]x").is_err());
        assert!(Endpoint::parse("http://[::1]x:80").is_err());
        assert!(Endpoint::parse("http://[::1]:").is_err());
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(Status::from(TransportError::Refused).code(), Code::Unavailable);
        assert_eq!(Status::from(TransportError::Reset(RESET_CANCEL)).code(), Code::Cancelled);
        assert_eq!(
            Status::from(TransportError::Reset(RESET_ENHANCE_YOUR_CALM)).code(),
            Code::ResourceExhausted
        );
        assert_eq!(Status::from(TransportError::Reset(0x2)).code(), Code::Internal);
        assert_eq!(
            Status::from(TransportError::Io(io::Error::other("boom"))).code(),
            Code::Unavailable
        );
    }

    #[tokio::test]
    async fn test_stream_pair_exchange() {
        let (client, mut server) = stream_pair(head(), 4);
        let HttpStream {
            mut body, response, ..
        } = client;

        body.send(Bytes::from_static(b"req")).await.unwrap();
        body.finish();
        assert_eq!(server.body.next().await.unwrap(), Bytes::from_static(b"req"));
        assert!(server.body.next().await.is_none());
        assert!(!server.reset.is_cancelled());

        let mut responder = server.responder;
        responder
            .send_head(ResponseHead {
                status: 200,
                headers: Metadata::new(),
            })
            .unwrap();
        responder.send_data(Bytes::from_static(b"resp")).await.unwrap();
        let mut trailers = Metadata::new();
        trailers.insert("grpc-status", "0");
        responder.send_trailers(trailers).await.unwrap();

        let (head, mut body) = response.recv().await.unwrap();
        assert_eq!(head.status, 200);
        assert!(matches!(body.next().await, Some(Ok(BodyFrame::Data(d))) if &d[..] == b"resp"));
        assert!(matches!(body.next().await, Some(Ok(BodyFrame::Trailers(_)))));
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_responder_ordering_enforced() {
        let (_client, server) = stream_pair(head(), 1);
        let mut responder = server.responder;
        assert!(matches!(
            responder.send_data(Bytes::new()).await,
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_and_failure_propagate() {
        let (client, server) = stream_pair(head(), 1);
        client.reset.reset();
        assert!(server.reset.is_cancelled());

        server.responder.fail(TransportError::Reset(RESET_REFUSED_STREAM));
        assert!(matches!(
            client.response.recv().await,
            Err(TransportError::Reset(RESET_REFUSED_STREAM))
        ));
    }
}
