//! Server side of `grpc.health.v1.Health`.

use crate::proto::{
    HealthCheckRequest, HealthCheckResponse, ServingStatus, request_marshaller,
    response_marshaller,
};
use grpc::{Method, MethodType, Router, ServerCallContext, ServerStreamWriter, Status};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

pub const SERVICE_NAME: &str = "grpc.health.v1.Health";

pub fn check_method() -> Method<HealthCheckRequest, HealthCheckResponse> {
    Method::new(
        MethodType::Unary,
        SERVICE_NAME,
        "Check",
        request_marshaller(),
        response_marshaller(),
    )
}

pub fn watch_method() -> Method<HealthCheckRequest, HealthCheckResponse> {
    Method::new(
        MethodType::ServerStreaming,
        SERVICE_NAME,
        "Watch",
        request_marshaller(),
        response_marshaller(),
    )
}

/// Serving status per service name, shared by every clone.
///
/// A cleared service keeps its watch channel while watchers exist so that
/// a later [`set_status`](Self::set_status) still reaches them.
#[derive(Clone, Default)]
pub struct HealthService {
    statuses: Arc<Mutex<HashMap<String, watch::Sender<ServingStatus>>>>,
}

impl HealthService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, service: &str, status: ServingStatus) {
        debug!(service, ?status, "health status updated");
        let mut statuses = self.statuses.lock();
        match statuses.get(service) {
            Some(tx) => {
                tx.send_replace(status);
            }
            None => {
                statuses.insert(service.to_string(), watch::channel(status).0);
            }
        }
    }

    /// Forget a service. Watchers observe `ServiceUnknown`.
    pub fn clear_status(&self, service: &str) {
        let mut statuses = self.statuses.lock();
        if let Some(tx) = statuses.get(service) {
            tx.send_replace(ServingStatus::ServiceUnknown);
            if tx.receiver_count() == 0 {
                statuses.remove(service);
            }
        }
    }

    pub fn clear_all(&self) {
        let mut statuses = self.statuses.lock();
        statuses.retain(|_, tx| {
            tx.send_replace(ServingStatus::ServiceUnknown);
            tx.receiver_count() > 0
        });
    }

    /// Current status, or `NotFound` for a service never set or cleared.
    pub fn check(&self, service: &str) -> Result<ServingStatus, Status> {
        match self.statuses.lock().get(service).map(|tx| *tx.borrow()) {
            Some(ServingStatus::ServiceUnknown) | None => {
                Err(Status::not_found(format!("Service '{service}' is not registered.")))
            }
            Some(status) => Ok(status),
        }
    }

    /// Subscribe to status changes, starting with the current status.
    ///
    /// Watching an unknown service tracks it as `ServiceUnknown` until the
    /// last watcher for it is dropped.
    pub fn watch(&self, service: &str) -> HealthWatcher {
        let rx = self
            .statuses
            .lock()
            .entry(service.to_string())
            .or_insert_with(|| watch::channel(ServingStatus::ServiceUnknown).0)
            .subscribe();
        HealthWatcher {
            statuses: self.statuses.clone(),
            service: service.to_string(),
            rx: Some(rx),
        }
    }

    /// Register `Check` and `Watch` on `router`.
    pub fn register(&self, router: Router) -> Router {
        let check = self.clone();
        let watch = self.clone();
        router
            .unary(
                &check_method(),
                move |request: HealthCheckRequest, _: ServerCallContext| {
                    let result = check
                        .check(&request.service)
                        .map(|status| HealthCheckResponse { status });
                    async move { result }
                },
            )
            .server_streaming(
                &watch_method(),
                move |request: HealthCheckRequest,
                      writer: ServerStreamWriter<HealthCheckResponse>,
                      _: ServerCallContext| {
                    let watcher = watch.watch(&request.service);
                    async move { stream_updates(watcher, writer).await }
                },
            )
    }
}

/// Status subscription for one service.
pub struct HealthWatcher {
    statuses: Arc<Mutex<HashMap<String, watch::Sender<ServingStatus>>>>,
    service: String,
    rx: Option<watch::Receiver<ServingStatus>>,
}

impl HealthWatcher {
    /// The latest status, marking it seen.
    pub fn current(&mut self) -> ServingStatus {
        match &mut self.rx {
            Some(rx) => *rx.borrow_and_update(),
            None => ServingStatus::ServiceUnknown,
        }
    }

    /// Wait for a status newer than the last one seen. Returns false once
    /// the service can no longer change.
    pub async fn changed(&mut self) -> bool {
        match &mut self.rx {
            Some(rx) => rx.changed().await.is_ok(),
            None => false,
        }
    }
}

impl Drop for HealthWatcher {
    fn drop(&mut self) {
        drop(self.rx.take());
        let mut statuses = self.statuses.lock();
        let unused = statuses.get(&self.service).is_some_and(|tx| {
            tx.receiver_count() == 0 && *tx.borrow() == ServingStatus::ServiceUnknown
        });
        if unused {
            statuses.remove(&self.service);
        }
    }
}

async fn stream_updates(
    mut watcher: HealthWatcher,
    writer: ServerStreamWriter<HealthCheckResponse>,
) -> Result<(), Status> {
    loop {
        let status = watcher.current();
        writer.write(&HealthCheckResponse { status }).await?;
        if !watcher.changed().await {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grpc::Code;

    #[test]
    fn test_check_and_clear() {
        let health = HealthService::new();
        assert_eq!(health.check("svc").unwrap_err().code(), Code::NotFound);

        health.set_status("svc", ServingStatus::Serving);
        assert_eq!(health.check("svc").unwrap(), ServingStatus::Serving);

        health.clear_status("svc");
        assert_eq!(health.check("svc").unwrap_err().code(), Code::NotFound);
    }

    #[test]
    fn test_clear_all() {
        let health = HealthService::new();
        health.set_status("", ServingStatus::Serving);
        health.set_status("a", ServingStatus::NotServing);
        health.clear_all();
        assert!(health.check("").is_err());
        assert!(health.check("a").is_err());
        assert!(health.statuses.lock().is_empty());
    }

    #[tokio::test]
    async fn test_watch_survives_clear() {
        let health = HealthService::new();
        let mut watcher = health.watch("svc");
        assert_eq!(watcher.current(), ServingStatus::ServiceUnknown);

        health.set_status("svc", ServingStatus::Serving);
        assert!(watcher.changed().await);
        assert_eq!(watcher.current(), ServingStatus::Serving);

        health.clear_status("svc");
        assert!(watcher.changed().await);
        assert_eq!(watcher.current(), ServingStatus::ServiceUnknown);

        health.set_status("svc", ServingStatus::NotServing);
        assert!(watcher.changed().await);
        assert_eq!(watcher.current(), ServingStatus::NotServing);
    }

    #[test]
    fn test_dropped_watchers_release_unknown_services() {
        let health = HealthService::new();
        let first = health.watch("ghost");
        let second = health.watch("ghost");
        drop(first);
        assert_eq!(health.statuses.lock().len(), 1);
        drop(second);
        assert!(health.statuses.lock().is_empty());

        health.set_status("real", ServingStatus::Serving);
        drop(health.watch("real"));
        assert_eq!(health.check("real").unwrap(), ServingStatus::Serving);
    }

    #[tokio::test]
    async fn test_cancelled_remote_watch_releases_service() {
        use crate::HealthClient;
        use grpc::{CallOptions, Channel, ChannelOptions, GrpcClient, LoopbackTransport};

        let health = HealthService::new();
        let channel = Channel::for_address(
            "http://health.local",
            ChannelOptions {
                transport: Some(LoopbackTransport::new(health.register(Router::new()))),
                ..Default::default()
            },
        )
        .unwrap();
        let client = HealthClient::from_invoker(channel.create_call_invoker());

        let mut call = client.watch("no-such-service", CallOptions::new());
        let first = call.response_stream.message().await.unwrap().unwrap();
        assert_eq!(first.status, ServingStatus::ServiceUnknown);
        assert_eq!(health.statuses.lock().len(), 1);

        call.cancel();
        drop(call);
        for _ in 0..100 {
            if health.statuses.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(health.statuses.lock().is_empty());
    }
}
