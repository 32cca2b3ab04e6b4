//! In-process transport serving requests from a [`Router`].

use crate::server::Router;
use crate::transport::{
    Connector, Endpoint, HttpStream, HttpTransport, RequestHead, TransportError, TransportFactory,
    stream_pair,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::trace;

const STREAM_BUFFER: usize = 16;

/// Transport that dispatches each stream to a router on a spawned task.
pub struct LoopbackTransport {
    router: Arc<Router>,
    closed: AtomicBool,
    streams: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new(router: Router) -> Arc<Self> {
        Arc::new(Self {
            router: Arc::new(router),
            closed: AtomicBool::new(false),
            streams: AtomicUsize::new(0),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of streams opened so far.
    pub fn streams_opened(&self) -> usize {
        self.streams.load(Ordering::Relaxed)
    }

    /// A factory producing a fresh transport over `router` for every channel.
    pub fn factory(router: Router) -> Arc<dyn TransportFactory> {
        Arc::new(move |endpoint: &Endpoint, _: Option<Connector>| {
            trace!(%endpoint, "creating loopback transport");
            Ok(LoopbackTransport::new(router.clone()) as Arc<dyn HttpTransport>)
        })
    }
}

#[async_trait]
impl HttpTransport for LoopbackTransport {
    async fn open_stream(&self, head: RequestHead) -> Result<HttpStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.streams.fetch_add(1, Ordering::Relaxed);
        let (client, server) = stream_pair(head, STREAM_BUFFER);
        let router = self.router.clone();
        tokio::spawn(async move { router.serve(server).await });
        Ok(client)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
