//! Named, typed gRPC client construction.

use crate::config::FactoryConfig;
use crate::error::FactoryError;
use crate::pool::{ChannelPool, EntryKey, PooledChannel};
use crate::registration::{ClientRegistration, InterceptorScope, ServiceProvider};
use dashmap::DashMap;
use grpc::{
    CallInvoker, CallObserver, CallOptionsConfigurationInvoker, Channel, ChannelOptions,
    GrpcClient, TransportFactory, intercept,
};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_HANDLER_LIFETIME: Duration = Duration::from_secs(120);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

type Activator<T> = Arc<dyn Fn(Arc<dyn CallInvoker>, &ServiceProvider) -> T + Send + Sync>;

/// Creates typed clients by name over pooled channels.
///
/// Clients created for the same name and type share a channel until the
/// channel's lifetime elapses. Cheap to clone.
#[derive(Clone)]
pub struct GrpcClientFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    registrations: HashMap<String, ClientRegistration>,
    services: ServiceProvider,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    observer: Option<Arc<dyn CallObserver>>,
    handler_lifetime: Option<Duration>,
    activators: DashMap<TypeId, Box<dyn Any + Send + Sync>>,
    pool: ChannelPool,
}

impl GrpcClientFactory {
    pub fn builder() -> GrpcClientFactoryBuilder {
        GrpcClientFactoryBuilder::default()
    }

    /// Create the client registered as `name`.
    ///
    /// Fails when `name` has no address or its channel cannot be built.
    pub fn create_client<T: GrpcClient>(&self, name: &str) -> Result<T, FactoryError> {
        let inner = &self.inner;
        let registration = inner
            .registrations
            .get(name)
            .filter(|registration| registration.address.is_some())
            .ok_or_else(|| FactoryError::NoAddress(name.to_string()))?;

        let lifetime = registration
            .handler_lifetime
            .unwrap_or(inner.handler_lifetime);
        let tracked = inner
            .pool
            .get_or_create(EntryKey::new::<T>(name), lifetime, || {
                inner.build_channel(name, registration)
            })?;

        let mut invoker: Arc<dyn CallInvoker> = tracked;
        invoker = intercept(
            invoker,
            registration.build_interceptors(InterceptorScope::Client, &inner.services),
        );
        if !registration.call_option_actions.is_empty() {
            invoker = Arc::new(CallOptionsConfigurationInvoker::new(
                invoker,
                registration.call_option_actions.clone(),
            ));
        }

        Ok(inner.activator::<T>()(invoker, &inner.services))
    }

    /// Retire channels past their lifetime and dispose retired channels no
    /// client uses anymore. Returns the number disposed.
    ///
    /// Runs on its own inside a tokio runtime; hosts without one call it
    /// periodically.
    pub fn cleanup_expired(&self) -> usize {
        self.inner.pool.cleanup_expired()
    }

    /// Number of channels currently serving new clients.
    pub fn active_channels(&self) -> usize {
        self.inner.pool.active_len()
    }

    /// Number of retired channels awaiting disposal.
    pub fn expired_channels(&self) -> usize {
        self.inner.pool.expired_len()
    }
}

impl FactoryInner {
    fn build_channel(
        &self,
        name: &str,
        registration: &ClientRegistration,
    ) -> Result<PooledChannel, FactoryError> {
        let Some(address) = registration.address.as_deref() else {
            return Err(FactoryError::NoAddress(name.to_string()));
        };

        let mut options = ChannelOptions {
            transport_factory: self.transport_factory.clone(),
            ..Default::default()
        };
        if let Some(observer) = &self.observer {
            options.observer = observer.clone();
        }
        for action in &registration.channel_actions {
            action(&mut options);
        }

        let channel = Channel::for_address(address, options).map_err(|source| {
            FactoryError::Channel {
                name: name.to_string(),
                source,
            }
        })?;
        debug!(name, address, "building channel");

        let invoker = intercept(
            channel.create_call_invoker(),
            registration.build_interceptors(InterceptorScope::Channel, &self.services),
        );
        Ok(PooledChannel { channel, invoker })
    }

    fn activator<T: GrpcClient>(&self) -> Activator<T> {
        let entry = self
            .activators
            .entry(TypeId::of::<T>())
            .or_insert_with(|| {
                let activator: Activator<T> = Arc::new(
                    |invoker: Arc<dyn CallInvoker>, _: &ServiceProvider| T::from_invoker(invoker),
                );
                Box::new(activator)
            });
        match entry.downcast_ref::<Activator<T>>() {
            Some(activator) => activator.clone(),
            None => unreachable!("activator registry is keyed by client type"),
        }
    }
}

#[derive(Default)]
pub struct GrpcClientFactoryBuilder {
    registrations: HashMap<String, ClientRegistration>,
    services: ServiceProvider,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    observer: Option<Arc<dyn CallObserver>>,
    handler_lifetime: Option<Option<Duration>>,
    cleanup_interval: Option<Duration>,
    activators: Vec<(TypeId, Box<dyn Any + Send + Sync>)>,
}

impl GrpcClientFactoryBuilder {
    /// Register a named client. Registering a name twice merges the two;
    /// later addresses and lifetimes win, actions accumulate.
    pub fn client(mut self, name: impl Into<String>, registration: ClientRegistration) -> Self {
        let name = name.into();
        let merged = match self.registrations.remove(&name) {
            Some(existing) => existing.merge(registration),
            None => registration,
        };
        self.registrations.insert(name, merged);
        self
    }

    /// Apply a parsed configuration: pool settings and `[client.<name>]`
    /// sections. Code registrations made afterwards layer on top.
    pub fn config(mut self, config: &FactoryConfig) -> Self {
        self.handler_lifetime = Some(config.pool.handler_lifetime());
        self.cleanup_interval = Some(config.pool.cleanup_interval());
        for (name, client) in &config.client {
            self = self.client(name.clone(), ClientRegistration::from_config(client));
        }
        self
    }

    pub fn services(mut self, services: ServiceProvider) -> Self {
        self.services = services;
        self
    }

    /// Transport used by every channel the factory builds. It is called
    /// while the pool holds the lock for the entry being built.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Default channel lifetime. `None` never expires.
    pub fn handler_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.handler_lifetime = Some(lifetime);
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Replace how clients of type `T` are constructed.
    pub fn activator<T, F>(mut self, activator: F) -> Self
    where
        T: GrpcClient,
        F: Fn(Arc<dyn CallInvoker>, &ServiceProvider) -> T + Send + Sync + 'static,
    {
        let activator: Activator<T> = Arc::new(activator);
        self.activators.push((TypeId::of::<T>(), Box::new(activator)));
        self
    }

    pub fn build(self) -> GrpcClientFactory {
        let activators = DashMap::new();
        for (type_id, activator) in self.activators {
            activators.insert(type_id, activator);
        }
        GrpcClientFactory {
            inner: Arc::new(FactoryInner {
                registrations: self.registrations,
                services: self.services,
                transport_factory: self.transport_factory,
                observer: self.observer,
                handler_lifetime: self
                    .handler_lifetime
                    .unwrap_or(Some(DEFAULT_HANDLER_LIFETIME)),
                activators,
                pool: ChannelPool::new(self.cleanup_interval.unwrap_or(DEFAULT_CLEANUP_INTERVAL)),
            }),
        }
    }
}
