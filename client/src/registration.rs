//! Per-client registration: address, channel options, call option
//! mutators and interceptors.

use crate::config::ClientConfig;
use grpc::{CallOptions, CallOptionsAction, ChannelOptions, Interceptor, MethodDescriptor};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Where an interceptor sits in the invoker chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorScope {
    /// Created once per channel and shared by every client on it.
    Channel,
    /// Created for each client.
    Client,
}

pub type ChannelOptionsAction = Arc<dyn Fn(&mut ChannelOptions) + Send + Sync>;

pub type InterceptorFactory = Arc<dyn Fn(&ServiceProvider) -> Arc<dyn Interceptor> + Send + Sync>;

/// Shared services handed to activators and interceptor factories.
#[derive(Clone, Default)]
pub struct ServiceProvider {
    services: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Send + Sync + 'static>(mut self, service: Arc<T>) -> Self {
        Arc::make_mut(&mut self.services).insert(TypeId::of::<T>(), service);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }
}

/// Settings for one named client.
#[derive(Clone, Default)]
pub struct ClientRegistration {
    pub(crate) address: Option<String>,
    pub(crate) handler_lifetime: Option<Option<Duration>>,
    pub(crate) channel_actions: Vec<ChannelOptionsAction>,
    pub(crate) call_option_actions: Vec<CallOptionsAction>,
    pub(crate) interceptors: Vec<(InterceptorScope, InterceptorFactory)>,
}

impl ClientRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Override the pool lifetime for this client. `None` never expires.
    pub fn handler_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.handler_lifetime = Some(lifetime);
        self
    }

    /// Mutate the options of channels built for this client. Runs once per
    /// channel, under the pool's lock for the entry being built.
    pub fn configure_channel<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut ChannelOptions) + Send + Sync + 'static,
    {
        self.channel_actions.push(Arc::new(action));
        self
    }

    /// Mutate the options of every call. Actions run in registration order.
    pub fn configure_call_options<F>(mut self, action: F) -> Self
    where
        F: Fn(&MethodDescriptor, &mut CallOptions) + Send + Sync + 'static,
    {
        self.call_option_actions.push(Arc::new(action));
        self
    }

    /// Add an interceptor built from the service provider. Interceptors run
    /// in registration order within a scope; client interceptors run before
    /// channel interceptors.
    ///
    /// Channel-scope factories run while the pool holds the lock for this
    /// client's entry; they must not create a client with the same name
    /// and type.
    pub fn interceptor<F>(mut self, scope: InterceptorScope, factory: F) -> Self
    where
        F: Fn(&ServiceProvider) -> Arc<dyn Interceptor> + Send + Sync + 'static,
    {
        self.interceptors.push((scope, Arc::new(factory)));
        self
    }

    pub(crate) fn build_interceptors(
        &self,
        scope: InterceptorScope,
        services: &ServiceProvider,
    ) -> Vec<Arc<dyn Interceptor>> {
        self.interceptors
            .iter()
            .filter(|(s, _)| *s == scope)
            .map(|(_, factory)| factory(services))
            .collect()
    }

    /// Layer settings from a config section under this registration.
    /// Values already registered in code take precedence.
    pub fn from_config(config: &ClientConfig) -> Self {
        let mut registration = ClientRegistration::new();
        registration.address = config.address.clone();

        let max_send = config.max_send_message_size;
        let max_receive = config.max_receive_message_size;
        let unsafe_creds = config.unsafe_use_insecure_channel_call_credentials;
        registration = registration.configure_channel(move |options| {
            if max_send.is_some() {
                options.max_send_message_size = max_send;
            }
            if max_receive.is_some() {
                options.max_receive_message_size = max_receive;
            }
            options.unsafe_use_insecure_channel_call_credentials |= unsafe_creds;
        });

        if !config.headers.is_empty() {
            let headers = config.headers.clone();
            registration = registration.configure_call_options(move |_, options| {
                for (key, value) in &headers {
                    options.headers_mut().insert(key.as_str(), value.as_str());
                }
            });
        }
        if let Some(timeout_ms) = config.timeout_ms {
            let timeout = Duration::from_millis(timeout_ms);
            registration = registration.configure_call_options(move |_, options| {
                if options.deadline().is_none() {
                    options.set_deadline(Instant::now().checked_add(timeout));
                }
            });
        }
        registration
    }

    /// Combine with `other`: its address and lifetime win when set; actions
    /// and interceptors of `other` run after ours.
    pub(crate) fn merge(mut self, other: ClientRegistration) -> Self {
        if other.address.is_some() {
            self.address = other.address;
        }
        if other.handler_lifetime.is_some() {
            self.handler_lifetime = other.handler_lifetime;
        }
        self.channel_actions.extend(other.channel_actions);
        self.call_option_actions.extend(other.call_option_actions);
        self.interceptors.extend(other.interceptors);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grpc::MethodType;

    #[test]
    fn test_service_provider() {
        let services = ServiceProvider::new().with(Arc::new(42u32));
        assert_eq!(services.get::<u32>().as_deref(), Some(&42));
        assert!(services.get::<String>().is_none());
    }

    #[test]
    fn test_from_config_actions() {
        let config = ClientConfig {
            address: Some("http://localhost:50051".into()),
            timeout_ms: Some(1500),
            max_receive_message_size: Some(1024),
            headers: [("x-team".to_string(), "payments".to_string())].into(),
            ..Default::default()
        };
        let registration = ClientRegistration::from_config(&config);
        assert_eq!(registration.address.as_deref(), Some("http://localhost:50051"));

        let mut channel = ChannelOptions::default();
        for action in &registration.channel_actions {
            action(&mut channel);
        }
        assert_eq!(channel.max_receive_message_size, Some(1024));
        assert_eq!(channel.max_send_message_size, None);

        let method = MethodDescriptor::new(MethodType::Unary, "svc", "M");
        let mut options = CallOptions::new();
        for action in &registration.call_option_actions {
            action(&method, &mut options);
        }
        assert_eq!(options.headers().get("x-team"), Some("payments"));
        assert!(options.deadline().is_some());
    }

    #[test]
    fn test_merge_prefers_later_address() {
        let merged = ClientRegistration::new()
            .address("http://a")
            .merge(ClientRegistration::new().address("http://b"));
        assert_eq!(merged.address.as_deref(), Some("http://b"));

        let kept = ClientRegistration::new()
            .address("http://a")
            .merge(ClientRegistration::new());
        assert_eq!(kept.address.as_deref(), Some("http://a"));
    }
}
