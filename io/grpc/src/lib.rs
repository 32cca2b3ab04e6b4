//! grpc - gRPC client call engine over a pluggable HTTP/2 transport.
//!
//! The crate turns typed method invocations into HTTP/2 request streams
//! and drives each call to a single terminal [`Status`]:
//!
//! - message framing (1 byte compressed flag, 4 byte big-endian length,
//!   payload) and serialization contexts
//! - unary, client-streaming, server-streaming and duplex calls with
//!   deadlines, cancellation, response headers and trailers
//! - channels, call invokers and interceptor chains
//! - an in-process [`Router`] and [`LoopbackTransport`] for serving
//!   methods without a network
//!
//! The HTTP/2 connection itself lives behind [`HttpTransport`]. Protobuf
//! encoding is left to [`Marshaller`]s supplied by the application.

mod call;
mod cancel;
mod channel;
mod credentials;
mod frame;
mod interceptor;
mod invoker;
mod loopback;
mod metadata;
mod method;
mod observer;
mod options;
pub mod percent;
mod serialization;
mod server;
mod status;
mod stream;
pub mod transport;

pub use call::{Call, CallPhase, CallRequest};
pub use cancel::CancellationToken;
pub use channel::{Channel, ChannelError, ChannelOptions};
pub use credentials::{AuthContext, CallCredentials, ChannelCredentials};
pub use frame::{
    DEFAULT_MAX_RECEIVE_MESSAGE_SIZE, FrameError, HEADER_SIZE, MessageDecoder, decode_message,
    encode_message, encode_message_with_compression, write_frame,
};
pub use interceptor::{
    CallOptionsAction, CallOptionsConfigurationInvoker, InterceptingInvoker, Interceptor,
    OptionsInterceptor, intercept,
};
pub use invoker::{CallInvoker, CallInvokerExt, GrpcClient};
pub use loopback::LoopbackTransport;
pub use metadata::{Metadata, Timeout};
pub use method::{MarshalError, Marshaller, Method, MethodDescriptor, MethodType};
pub use observer::{CallCounters, CallCountersSnapshot, CallObserver, ObserverSet, TracingObserver};
pub use options::CallOptions;
pub use serialization::{SerializationContext, SerializationState};
pub use server::{RequestStream, Router, ServerCallContext, ServerStreamWriter};
pub use status::{Code, Status};
pub use stream::{
    AsyncClientStreamingCall, AsyncDuplexStreamingCall, AsyncServerStreamingCall, AsyncUnaryCall,
    ClientStreamWriter, StreamReader,
};
pub use transport::{Endpoint, HttpTransport, TransportError, TransportFactory};
