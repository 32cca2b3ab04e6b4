//! Typed views over a [`Call`]: request writers, response readers and the
//! handles returned for each call shape.

use crate::call::Call;
use crate::metadata::Metadata;
use crate::method::Marshaller;
use crate::serialization::SerializationContext;
use crate::status::Status;
use futures::Stream;
use parking_lot::Mutex;

/// Writes request messages on a client-streaming or duplex call.
///
/// The writer may be shared between tasks, but only one write may be in
/// flight at a time.
pub struct ClientStreamWriter<T> {
    call: Call,
    marshaller: Marshaller<T>,
    context: Mutex<SerializationContext>,
}

impl<T: 'static> ClientStreamWriter<T> {
    pub(crate) fn new(call: Call, marshaller: Marshaller<T>) -> Self {
        Self {
            call,
            marshaller,
            context: Mutex::new(SerializationContext::new()),
        }
    }

    /// Serialize and send a message.
    ///
    /// Fails with the call status if the call has already completed.
    ///
    /// # Panics
    ///
    /// Panics if another write is in progress or [`complete`](Self::complete)
    /// was already called.
    pub async fn write(&self, message: &T) -> Result<(), Status> {
        if self.call.is_request_completed() {
            panic!("request stream has already been completed");
        }
        let payload = {
            let Some(mut context) = self.context.try_lock() else {
                panic!("a write is already in progress; only one write may be pending at a time");
            };
            self.marshaller.serialize(message, &mut context)?
        };
        self.call.write(payload).await
    }

    /// Signal that no more messages will be written.
    pub fn complete(&self) {
        self.call.complete_request();
    }
}

/// Reads response messages in order.
pub struct StreamReader<T> {
    call: Call,
    marshaller: Marshaller<T>,
}

impl<T: 'static> StreamReader<T> {
    pub(crate) fn new(call: Call, marshaller: Marshaller<T>) -> Self {
        Self { call, marshaller }
    }

    /// The next message, `Ok(None)` at the end of a successful stream, or the
    /// call's error status.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        let Some(payload) = self.call.read().await? else {
            return Ok(None);
        };
        match self.marshaller.deserialize(payload) {
            Ok(message) => Ok(Some(message)),
            Err(status) => {
                self.call.abort(status.clone());
                Err(status)
            }
        }
    }

    /// Adapt the reader into a [`Stream`] that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, Status>> {
        futures::stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.message().await {
                Ok(Some(message)) => Some((Ok(message), Some(reader))),
                Ok(None) => None,
                Err(status) => Some((Err(status), None)),
            }
        })
    }
}

/// Read the single response of a unary-response call.
async fn single_response<T: 'static>(call: &Call, marshaller: &Marshaller<T>) -> Result<T, Status> {
    let Some(payload) = call.read().await? else {
        return Err(Status::internal("Failed to deserialize response message: no message returned."));
    };
    if call.read().await?.is_some() {
        let status = Status::internal("Received more than one response message for a unary call.");
        call.abort(status.clone());
        return Err(status);
    }
    marshaller.deserialize(payload)
}

macro_rules! call_accessors {
    () => {
        /// The underlying untyped call.
        pub fn call(&self) -> &Call {
            &self.call
        }

        /// Wait for the response headers.
        pub async fn response_headers(&self) -> Result<Metadata, Status> {
            self.call.response_headers().await
        }

        /// The terminal status, once available.
        pub fn status(&self) -> Option<Status> {
            self.call.status()
        }

        /// Trailers, once the call has completed.
        pub fn trailers(&self) -> Option<Metadata> {
            self.call.trailers()
        }

        pub fn cancel(&self) {
            self.call.cancel();
        }
    };
}

pub struct AsyncUnaryCall<Resp> {
    call: Call,
    marshaller: Marshaller<Resp>,
}

impl<Resp: 'static> AsyncUnaryCall<Resp> {
    pub(crate) fn new(call: Call, marshaller: Marshaller<Resp>) -> Self {
        Self { call, marshaller }
    }

    call_accessors!();

    /// Wait for the response message.
    pub async fn response(&self) -> Result<Resp, Status> {
        single_response(&self.call, &self.marshaller).await
    }
}

pub struct AsyncClientStreamingCall<Req, Resp> {
    pub request_stream: ClientStreamWriter<Req>,
    call: Call,
    marshaller: Marshaller<Resp>,
}

impl<Req: 'static, Resp: 'static> AsyncClientStreamingCall<Req, Resp> {
    pub(crate) fn new(call: Call, request: Marshaller<Req>, response: Marshaller<Resp>) -> Self {
        Self {
            request_stream: ClientStreamWriter::new(call.clone(), request),
            call,
            marshaller: response,
        }
    }

    call_accessors!();

    pub async fn response(&self) -> Result<Resp, Status> {
        single_response(&self.call, &self.marshaller).await
    }
}

pub struct AsyncServerStreamingCall<Resp> {
    pub response_stream: StreamReader<Resp>,
    call: Call,
}

impl<Resp: 'static> AsyncServerStreamingCall<Resp> {
    pub(crate) fn new(call: Call, marshaller: Marshaller<Resp>) -> Self {
        Self {
            response_stream: StreamReader::new(call.clone(), marshaller),
            call,
        }
    }

    call_accessors!();
}

/// Duplex call. The writer and reader are independent and can be moved
/// to different tasks.
pub struct AsyncDuplexStreamingCall<Req, Resp> {
    pub request_stream: ClientStreamWriter<Req>,
    pub response_stream: StreamReader<Resp>,
    call: Call,
}

impl<Req: 'static, Resp: 'static> AsyncDuplexStreamingCall<Req, Resp> {
    pub(crate) fn new(call: Call, request: Marshaller<Req>, response: Marshaller<Resp>) -> Self {
        Self {
            request_stream: ClientStreamWriter::new(call.clone(), request),
            response_stream: StreamReader::new(call.clone(), response),
            call,
        }
    }

    call_accessors!();

    /// Split into the writer and reader halves.
    pub fn split(self) -> (ClientStreamWriter<Req>, StreamReader<Resp>) {
        (self.request_stream, self.response_stream)
    }
}
