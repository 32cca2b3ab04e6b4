//! Named gRPC client factory.
//!
//! Clients are registered by name with an address, channel settings, call
//! option mutators and interceptors, then created on demand as typed
//! clients. Channels are pooled per (name, client type) and rotated when
//! their lifetime elapses; a rotated channel is disposed once the last
//! client using it is gone.
//!
//! # Example
//!
//! ```no_run
//! use grpc::{LoopbackTransport, Router};
//! use grpc_client_factory::{ClientRegistration, GrpcClientFactory};
//! use grpc_health::{HealthClient, HealthService};
//!
//! # fn example() -> Result<(), grpc_client_factory::FactoryError> {
//! let router = HealthService::new().register(Router::new());
//! let factory = GrpcClientFactory::builder()
//!     .transport_factory(LoopbackTransport::factory(router))
//!     .client("inventory", ClientRegistration::new().address("http://inventory.internal"))
//!     .build();
//!
//! let health: HealthClient = factory.create_client("inventory")?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod factory;
pub mod logging;
mod pool;
mod registration;

pub use config::{ClientConfig, ConfigError, FactoryConfig, LoggingConfig, PoolConfig};
pub use error::FactoryError;
pub use factory::{GrpcClientFactory, GrpcClientFactoryBuilder};
pub use registration::{
    ChannelOptionsAction, ClientRegistration, InterceptorFactory, InterceptorScope,
    ServiceProvider,
};
