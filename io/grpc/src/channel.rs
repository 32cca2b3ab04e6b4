//! Channels.
//!
//! A channel binds a target address to a transport and to the settings its
//! calls share. It is cheap to clone and safe to use from many tasks.

use crate::call::{Call, CallRequest, CallSettings};
use crate::credentials::ChannelCredentials;
use crate::frame::DEFAULT_MAX_RECEIVE_MESSAGE_SIZE;
use crate::invoker::CallInvoker;
use crate::method::MethodDescriptor;
use crate::observer::{CallObserver, TracingObserver};
use crate::options::CallOptions;
use crate::status::Status;
use crate::transport::{Connector, Endpoint, HttpTransport, TransportError, TransportFactory};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const USER_AGENT: &str = concat!("grpc-rust/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error(
        "call credentials require a secure channel but '{0}' is plaintext; \
         set unsafe_use_insecure_channel_call_credentials to allow this"
    )]
    InsecureCallCredentials(String),
    #[error("channel credentials are {credentials} but the address '{address}' uses {scheme}")]
    SchemeMismatch {
        address: String,
        credentials: &'static str,
        scheme: &'static str,
    },
    #[error("no transport configured for '{0}'")]
    NoTransport(String),
    #[error("failed to create transport: {0}")]
    Transport(#[from] TransportError),
}

/// Options used when building a [`Channel`].
#[derive(Clone)]
pub struct ChannelOptions {
    /// Credentials. When unset, security follows the address scheme.
    pub credentials: Option<ChannelCredentials>,
    /// Use this transport as-is.
    pub transport: Option<Arc<dyn HttpTransport>>,
    /// Create the transport from the endpoint when `transport` is unset.
    pub transport_factory: Option<Arc<dyn TransportFactory>>,
    /// Custom connection callback handed to the transport factory.
    pub connector: Option<Connector>,
    /// Largest request message, unlimited when unset.
    pub max_send_message_size: Option<usize>,
    /// Largest response message, unlimited when unset.
    pub max_receive_message_size: Option<usize>,
    pub unsafe_use_insecure_channel_call_credentials: bool,
    pub observer: Arc<dyn CallObserver>,
    /// Response messages buffered per call ahead of the reader.
    pub message_buffer: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            credentials: None,
            transport: None,
            transport_factory: None,
            connector: None,
            max_send_message_size: None,
            max_receive_message_size: Some(DEFAULT_MAX_RECEIVE_MESSAGE_SIZE),
            unsafe_use_insecure_channel_call_credentials: false,
            observer: Arc::new(TracingObserver),
            message_buffer: 16,
        }
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("credentials", &self.credentials)
            .field("transport", &self.transport.is_some())
            .field("transport_factory", &self.transport_factory.is_some())
            .field("connector", &self.connector.is_some())
            .field("max_send_message_size", &self.max_send_message_size)
            .field("max_receive_message_size", &self.max_receive_message_size)
            .field(
                "unsafe_use_insecure_channel_call_credentials",
                &self.unsafe_use_insecure_channel_call_credentials,
            )
            .field("message_buffer", &self.message_buffer)
            .finish()
    }
}

struct ChannelInner {
    target: String,
    endpoint: Endpoint,
    settings: Arc<CallSettings>,
    disposed: AtomicBool,
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.inner.target)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Channel {
    /// Build a channel for `address` (`http://host:port` or `https://...`).
    ///
    /// Configuration mistakes are reported here rather than on the first
    /// call: an unparseable address, credentials that disagree with the
    /// scheme, call credentials on a plaintext address, or no transport.
    pub fn for_address(address: &str, options: ChannelOptions) -> Result<Channel, ChannelError> {
        let endpoint = Endpoint::parse(address).map_err(ChannelError::InvalidAddress)?;

        let credentials = match options.credentials.clone() {
            Some(credentials) => {
                if credentials.is_secure() != endpoint.is_secure() {
                    return Err(ChannelError::SchemeMismatch {
                        address: address.to_string(),
                        credentials: if credentials.is_secure() { "secure" } else { "insecure" },
                        scheme: endpoint.scheme().as_str(),
                    });
                }
                credentials
            }
            None if endpoint.is_secure() => ChannelCredentials::ssl(),
            None => ChannelCredentials::insecure(),
        };

        if credentials.call_credentials().is_some()
            && !credentials.is_secure()
            && !options.unsafe_use_insecure_channel_call_credentials
        {
            return Err(ChannelError::InsecureCallCredentials(address.to_string()));
        }

        let transport = match (&options.transport, &options.transport_factory) {
            (Some(transport), _) => transport.clone(),
            (None, Some(factory)) => factory.create(&endpoint, options.connector.clone())?,
            (None, None) => return Err(ChannelError::NoTransport(address.to_string())),
        };

        let settings = CallSettings {
            scheme: endpoint.scheme(),
            authority: endpoint.authority(),
            transport,
            observer: options.observer.clone(),
            max_send_message_size: options.max_send_message_size,
            max_receive_message_size: options.max_receive_message_size.unwrap_or(usize::MAX),
            call_credentials: credentials.call_credentials().cloned(),
            allow_insecure_call_credentials: options.unsafe_use_insecure_channel_call_credentials,
            user_agent: USER_AGENT.to_string(),
            message_buffer: options.message_buffer,
        };

        debug!(address, "channel created");
        Ok(Channel {
            inner: Arc::new(ChannelInner {
                target: address.to_string(),
                endpoint,
                settings: Arc::new(settings),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn create_call_invoker(&self) -> Arc<dyn CallInvoker> {
        Arc::new(ChannelInvoker {
            channel: self.clone(),
        })
    }

    /// Close the transport. Calls started afterwards fail with `Unavailable`.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            self.inner.settings.transport.close();
            info!(address = %self.inner.target, "channel disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// True when both handles refer to the same channel.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// The base invoker, starting calls directly on a channel.
struct ChannelInvoker {
    channel: Channel,
}

impl CallInvoker for ChannelInvoker {
    fn start_call(
        &self,
        method: &MethodDescriptor,
        host: Option<&str>,
        options: CallOptions,
        request: CallRequest,
    ) -> Call {
        if self.channel.is_disposed() {
            return Call::failed(
                method.clone(),
                Status::unavailable(format!("channel '{}' has been disposed", self.channel.target())),
            );
        }
        Call::start(
            method.clone(),
            self.channel.inner.settings.clone(),
            host,
            options,
            request,
        )
    }
}
