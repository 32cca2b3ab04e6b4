//! `grpc.health.v1` health checking.
//!
//! [`HealthService`] keeps a serving status per service name and answers
//! `Check` and `Watch` once registered on a [`grpc::Router`].
//! [`HealthClient`] is the matching typed client.

mod client;
mod proto;
mod service;

pub use client::HealthClient;
pub use proto::{HealthCheckRequest, HealthCheckResponse, ServingStatus};
pub use service::{HealthService, HealthWatcher, SERVICE_NAME, check_method, watch_method};
