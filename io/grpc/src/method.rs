//! Method descriptors and message marshallers.

use crate::serialization::SerializationContext;
use crate::status::Status;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// The four gRPC call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    DuplexStreaming,
}

impl MethodType {
    /// The client sends exactly one request message.
    pub fn is_unary_request(self) -> bool {
        matches!(self, MethodType::Unary | MethodType::ServerStreaming)
    }

    /// The server sends exactly one response message.
    pub fn is_unary_response(self) -> bool {
        matches!(self, MethodType::Unary | MethodType::ClientStreaming)
    }
}

/// Untyped description of a method: its shape and its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    kind: MethodType,
    service: Arc<str>,
    name: Arc<str>,
    path: Arc<str>,
}

impl MethodDescriptor {
    pub fn new(kind: MethodType, service: &str, name: &str) -> Self {
        Self {
            kind,
            service: service.into(),
            name: name.into(),
            path: format!("/{service}/{name}").into(),
        }
    }

    pub fn kind(&self) -> MethodType {
        self.kind
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request path, `/{service}/{method}`.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Error raised by a marshaller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MarshalError(pub String);

impl MarshalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

type SerializeFn<T> = dyn Fn(&T, &mut SerializationContext) -> Result<(), MarshalError> + Send + Sync;
type DeserializeFn<T> = dyn Fn(Bytes) -> Result<T, MarshalError> + Send + Sync;

/// Converts messages of type `T` to and from payload bytes.
pub struct Marshaller<T> {
    serializer: Arc<SerializeFn<T>>,
    deserializer: Arc<DeserializeFn<T>>,
}

impl<T> Clone for Marshaller<T> {
    fn clone(&self) -> Self {
        Self {
            serializer: self.serializer.clone(),
            deserializer: self.deserializer.clone(),
        }
    }
}

impl<T> fmt::Debug for Marshaller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marshaller").finish_non_exhaustive()
    }
}

impl<T: 'static> Marshaller<T> {
    /// Build a marshaller that writes through a [`SerializationContext`].
    pub fn contextual<S, D>(serializer: S, deserializer: D) -> Self
    where
        S: Fn(&T, &mut SerializationContext) -> Result<(), MarshalError> + Send + Sync + 'static,
        D: Fn(Bytes) -> Result<T, MarshalError> + Send + Sync + 'static,
    {
        Self {
            serializer: Arc::new(serializer),
            deserializer: Arc::new(deserializer),
        }
    }

    /// Build a marshaller from plain encode and decode functions.
    pub fn new<S, D>(serializer: S, deserializer: D) -> Self
    where
        S: Fn(&T) -> Vec<u8> + Send + Sync + 'static,
        D: Fn(Bytes) -> Result<T, MarshalError> + Send + Sync + 'static,
    {
        Self::contextual(
            move |msg, ctx| {
                ctx.complete_with(serializer(msg));
                Ok(())
            },
            deserializer,
        )
    }

    /// Serialize `message` and return the payload.
    ///
    /// A marshaller that returns without completing the context is reported
    /// as `Internal`.
    pub fn serialize(&self, message: &T, ctx: &mut SerializationContext) -> Result<Bytes, Status> {
        ctx.reset();
        (self.serializer)(message, ctx)
            .map_err(|e| Status::internal(format!("Error serializing message: {e}")))?;
        if !ctx.is_complete() {
            return Err(Status::internal(
                "Error serializing message: serializer did not complete the context",
            ));
        }
        Ok(ctx.payload())
    }

    pub fn deserialize(&self, payload: Bytes) -> Result<T, Status> {
        (self.deserializer)(payload)
            .map_err(|e| Status::internal(format!("Error deserializing message: {e}")))
    }
}

impl Marshaller<Bytes> {
    /// Pass payloads through untouched.
    pub fn bytes() -> Self {
        Self::contextual(
            |msg: &Bytes, ctx| {
                ctx.complete_with(msg.clone());
                Ok(())
            },
            Ok,
        )
    }
}

impl Marshaller<String> {
    /// UTF-8 strings.
    pub fn utf8() -> Self {
        Self::new(
            |msg: &String| msg.as_bytes().to_vec(),
            |payload| {
                String::from_utf8(payload.to_vec()).map_err(|e| MarshalError::new(e.to_string()))
            },
        )
    }
}

/// A fully typed method: descriptor plus request and response marshallers.
pub struct Method<Req, Resp> {
    descriptor: MethodDescriptor,
    request: Marshaller<Req>,
    response: Marshaller<Resp>,
}

impl<Req, Resp> Clone for Method<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            request: self.request.clone(),
            response: self.response.clone(),
        }
    }
}

impl<Req, Resp> Method<Req, Resp> {
    pub fn new(
        kind: MethodType,
        service: &str,
        name: &str,
        request: Marshaller<Req>,
        response: Marshaller<Resp>,
    ) -> Self {
        Self {
            descriptor: MethodDescriptor::new(kind, service, name),
            request,
            response,
        }
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    pub fn request_marshaller(&self) -> &Marshaller<Req> {
        &self.request
    }

    pub fn response_marshaller(&self) -> &Marshaller<Resp> {
        &self.response
    }
}
