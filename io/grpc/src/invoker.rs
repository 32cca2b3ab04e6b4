//! Call invokers.
//!
//! A [`CallInvoker`] starts untyped calls. Channels provide the base
//! invoker; interceptors and option mutators wrap it. [`CallInvokerExt`]
//! adds typed entry points for the four call shapes.

use crate::call::{Call, CallRequest};
use crate::method::{Method, MethodDescriptor};
use crate::options::CallOptions;
use crate::serialization::SerializationContext;
use crate::stream::{
    AsyncClientStreamingCall, AsyncDuplexStreamingCall, AsyncServerStreamingCall, AsyncUnaryCall,
};
use std::sync::Arc;

pub trait CallInvoker: Send + Sync {
    /// Start a call. Never blocks; failures surface through the call status.
    fn start_call(
        &self,
        method: &MethodDescriptor,
        host: Option<&str>,
        options: CallOptions,
        request: CallRequest,
    ) -> Call;
}

impl<T: CallInvoker + ?Sized> CallInvoker for Arc<T> {
    fn start_call(
        &self,
        method: &MethodDescriptor,
        host: Option<&str>,
        options: CallOptions,
        request: CallRequest,
    ) -> Call {
        (**self).start_call(method, host, options, request)
    }
}

/// A typed client built over an invoker, usually generated per service.
pub trait GrpcClient: Sized + Send + 'static {
    fn from_invoker(invoker: Arc<dyn CallInvoker>) -> Self;
}

/// Typed call helpers available on every invoker.
pub trait CallInvokerExt: CallInvoker {
    fn async_unary_call<Req: 'static, Resp: 'static>(
        &self,
        method: &Method<Req, Resp>,
        host: Option<&str>,
        options: CallOptions,
        request: &Req,
    ) -> AsyncUnaryCall<Resp> {
        let call = start_with_message(self, method, host, options, request);
        AsyncUnaryCall::new(call, method.response_marshaller().clone())
    }

    fn async_client_streaming_call<Req: 'static, Resp: 'static>(
        &self,
        method: &Method<Req, Resp>,
        host: Option<&str>,
        options: CallOptions,
    ) -> AsyncClientStreamingCall<Req, Resp> {
        let call = self.start_call(method.descriptor(), host, options, CallRequest::Stream);
        AsyncClientStreamingCall::new(
            call,
            method.request_marshaller().clone(),
            method.response_marshaller().clone(),
        )
    }

    fn async_server_streaming_call<Req: 'static, Resp: 'static>(
        &self,
        method: &Method<Req, Resp>,
        host: Option<&str>,
        options: CallOptions,
        request: &Req,
    ) -> AsyncServerStreamingCall<Resp> {
        let call = start_with_message(self, method, host, options, request);
        AsyncServerStreamingCall::new(call, method.response_marshaller().clone())
    }

    fn async_duplex_streaming_call<Req: 'static, Resp: 'static>(
        &self,
        method: &Method<Req, Resp>,
        host: Option<&str>,
        options: CallOptions,
    ) -> AsyncDuplexStreamingCall<Req, Resp> {
        let call = self.start_call(method.descriptor(), host, options, CallRequest::Stream);
        AsyncDuplexStreamingCall::new(
            call,
            method.request_marshaller().clone(),
            method.response_marshaller().clone(),
        )
    }
}

impl<T: CallInvoker + ?Sized> CallInvokerExt for T {}

fn start_with_message<I, Req, Resp>(
    invoker: &I,
    method: &Method<Req, Resp>,
    host: Option<&str>,
    options: CallOptions,
    request: &Req,
) -> Call
where
    I: CallInvoker + ?Sized,
    Req: 'static,
{
    match method
        .request_marshaller()
        .serialize(request, &mut SerializationContext::new())
    {
        Ok(payload) => invoker.start_call(method.descriptor(), host, options, CallRequest::Message(payload)),
        Err(status) => Call::failed(method.descriptor().clone(), status),
    }
}
