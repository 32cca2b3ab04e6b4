//! Channel and call credentials.
//!
//! Certificate handling belongs to the transport. This module only tracks
//! whether a channel is meant to be secure and which per-call metadata
//! providers (tokens, API keys) should run before each call.

use crate::metadata::Metadata;
use crate::method::MethodDescriptor;
use crate::status::Status;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Information handed to a call credentials provider.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// `https://{authority}/{service}` for the call being authorized.
    pub service_url: String,
    pub method: MethodDescriptor,
}

type Provider = dyn Fn(AuthContext) -> BoxFuture<'static, Result<Metadata, Status>> + Send + Sync;

/// Asynchronous providers of per-call metadata.
#[derive(Clone)]
pub struct CallCredentials {
    providers: Vec<Arc<Provider>>,
}

impl fmt::Debug for CallCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCredentials")
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl CallCredentials {
    pub fn from_fn<F, Fut>(provider: F) -> Self
    where
        F: Fn(AuthContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Metadata, Status>> + Send + 'static,
    {
        Self {
            providers: vec![Arc::new(move |ctx| Box::pin(provider(ctx)))],
        }
    }

    /// Credentials that always add the given metadata.
    pub fn from_metadata(metadata: Metadata) -> Self {
        Self::from_fn(move |_| {
            let metadata = metadata.clone();
            async move { Ok(metadata) }
        })
    }

    /// Run `self` then `other`, merging their metadata.
    pub fn compose(mut self, other: CallCredentials) -> Self {
        self.providers.extend(other.providers);
        self
    }

    /// Run every provider in order and append its metadata to `headers`.
    ///
    /// A failing provider fails the call. Unless the provider returned a
    /// more specific code the failure is reported as `Unavailable`.
    pub(crate) async fn apply(&self, ctx: &AuthContext, headers: &mut Metadata) -> Result<(), Status> {
        for provider in &self.providers {
            let metadata = provider(ctx.clone()).await.map_err(|status| {
                if status.is_ok() {
                    Status::unavailable("call credentials provider failed")
                } else {
                    status
                }
            })?;
            headers.extend(metadata);
        }
        Ok(())
    }
}

/// Transport security for a channel plus optional channel-wide call
/// credentials.
#[derive(Debug, Clone)]
pub struct ChannelCredentials {
    secure: bool,
    call: Option<CallCredentials>,
}

impl ChannelCredentials {
    /// Plaintext HTTP/2.
    pub fn insecure() -> Self {
        Self {
            secure: false,
            call: None,
        }
    }

    /// TLS, with certificate validation left to the transport.
    pub fn ssl() -> Self {
        Self {
            secure: true,
            call: None,
        }
    }

    /// Attach call credentials that run for every call on the channel.
    pub fn composite(channel: ChannelCredentials, call: CallCredentials) -> Self {
        let call = match channel.call {
            Some(existing) => existing.compose(call),
            None => call,
        };
        Self {
            secure: channel.secure,
            call: Some(call),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn call_credentials(&self) -> Option<&CallCredentials> {
        self.call.as_ref()
    }
}
