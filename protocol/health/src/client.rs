//! Typed client for `grpc.health.v1.Health`.

use crate::proto::{HealthCheckRequest, HealthCheckResponse, ServingStatus};
use crate::service::{check_method, watch_method};
use grpc::{AsyncServerStreamingCall, CallInvoker, CallInvokerExt, CallOptions, GrpcClient, Method, Status};
use std::sync::Arc;

#[derive(Clone)]
pub struct HealthClient {
    invoker: Arc<dyn CallInvoker>,
    check: Method<HealthCheckRequest, HealthCheckResponse>,
    watch: Method<HealthCheckRequest, HealthCheckResponse>,
}

impl GrpcClient for HealthClient {
    fn from_invoker(invoker: Arc<dyn CallInvoker>) -> Self {
        Self {
            invoker,
            check: check_method(),
            watch: watch_method(),
        }
    }
}

impl HealthClient {
    pub fn new(invoker: Arc<dyn CallInvoker>) -> Self {
        Self::from_invoker(invoker)
    }

    pub async fn check(&self, service: &str, options: CallOptions) -> Result<ServingStatus, Status> {
        let request = HealthCheckRequest {
            service: service.to_string(),
        };
        let call = self.invoker.async_unary_call(&self.check, None, options, &request);
        Ok(call.response().await?.status)
    }

    /// Stream status changes for `service`, starting with the current one.
    pub fn watch(&self, service: &str, options: CallOptions) -> AsyncServerStreamingCall<HealthCheckResponse> {
        let request = HealthCheckRequest {
            service: service.to_string(),
        };
        self.invoker
            .async_server_streaming_call(&self.watch, None, options, &request)
    }
}
