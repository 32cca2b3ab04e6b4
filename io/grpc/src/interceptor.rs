//! Interceptor chains and call option mutators.

use crate::call::{Call, CallRequest};
use crate::invoker::CallInvoker;
use crate::method::MethodDescriptor;
use crate::options::CallOptions;
use std::sync::Arc;

/// Wraps call start. An interceptor may inspect or replace the options,
/// observe the returned call, or fail the call without delegating.
pub trait Interceptor: Send + Sync {
    fn start_call(
        &self,
        method: &MethodDescriptor,
        host: Option<&str>,
        options: CallOptions,
        request: CallRequest,
        next: &dyn CallInvoker,
    ) -> Call;
}

/// Interceptor built from a closure that rewrites call options.
pub struct OptionsInterceptor<F> {
    f: F,
}

impl<F> OptionsInterceptor<F>
where
    F: Fn(&MethodDescriptor, CallOptions) -> CallOptions + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Interceptor for OptionsInterceptor<F>
where
    F: Fn(&MethodDescriptor, CallOptions) -> CallOptions + Send + Sync,
{
    fn start_call(
        &self,
        method: &MethodDescriptor,
        host: Option<&str>,
        options: CallOptions,
        request: CallRequest,
        next: &dyn CallInvoker,
    ) -> Call {
        next.start_call(method, host, (self.f)(method, options), request)
    }
}

/// An invoker decorated with one interceptor.
pub struct InterceptingInvoker {
    inner: Arc<dyn CallInvoker>,
    interceptor: Arc<dyn Interceptor>,
}

impl InterceptingInvoker {
    pub fn new(inner: Arc<dyn CallInvoker>, interceptor: Arc<dyn Interceptor>) -> Self {
        Self { inner, interceptor }
    }
}

impl CallInvoker for InterceptingInvoker {
    fn start_call(
        &self,
        method: &MethodDescriptor,
        host: Option<&str>,
        options: CallOptions,
        request: CallRequest,
    ) -> Call {
        self.interceptor
            .start_call(method, host, options, request, self.inner.as_ref())
    }
}

/// Wrap `invoker` with `interceptors`. The first interceptor runs first.
pub fn intercept(
    invoker: Arc<dyn CallInvoker>,
    interceptors: impl IntoIterator<Item = Arc<dyn Interceptor>>,
) -> Arc<dyn CallInvoker> {
    let interceptors: Vec<_> = interceptors.into_iter().collect();
    interceptors
        .into_iter()
        .rev()
        .fold(invoker, |inner, interceptor| {
            Arc::new(InterceptingInvoker::new(inner, interceptor)) as Arc<dyn CallInvoker>
        })
}

/// Mutates the options of every call before it starts.
pub type CallOptionsAction = Arc<dyn Fn(&MethodDescriptor, &mut CallOptions) + Send + Sync>;

/// Applies an ordered list of option mutators before delegating.
pub struct CallOptionsConfigurationInvoker {
    inner: Arc<dyn CallInvoker>,
    actions: Vec<CallOptionsAction>,
}

impl CallOptionsConfigurationInvoker {
    pub fn new(inner: Arc<dyn CallInvoker>, actions: Vec<CallOptionsAction>) -> Self {
        Self { inner, actions }
    }
}

impl CallInvoker for CallOptionsConfigurationInvoker {
    fn start_call(
        &self,
        method: &MethodDescriptor,
        host: Option<&str>,
        mut options: CallOptions,
        request: CallRequest,
    ) -> Call {
        for action in &self.actions {
            action(method, &mut options);
        }
        self.inner.start_call(method, host, options, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodType;
    use crate::status::Status;
    use parking_lot::Mutex;

    /// Records the options it sees and fails the call.
    #[derive(Default)]
    struct RecordingInvoker {
        seen: Mutex<Vec<CallOptions>>,
    }

    impl CallInvoker for RecordingInvoker {
        fn start_call(
            &self,
            method: &MethodDescriptor,
            _host: Option<&str>,
            options: CallOptions,
            _request: CallRequest,
        ) -> Call {
            self.seen.lock().push(options);
            Call::failed(method.clone(), Status::unavailable("recorded"))
        }
    }

    fn tagger(tag: &'static str) -> Arc<dyn Interceptor> {
        Arc::new(OptionsInterceptor::new(move |_: &MethodDescriptor, options: CallOptions| {
            options.with_header("x-order", tag)
        }))
    }

    fn method() -> MethodDescriptor {
        MethodDescriptor::new(MethodType::Unary, "svc", "M")
    }

    #[test]
    fn test_intercept_order() {
        let recorder = Arc::new(RecordingInvoker::default());
        let invoker = intercept(recorder.clone(), [tagger("first"), tagger("second")]);

        invoker.start_call(&method(), None, CallOptions::new(), CallRequest::Stream);

        let seen = recorder.seen.lock();
        assert_eq!(
            seen[0].headers().get_all("x-order").unwrap(),
            &["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn test_configuration_actions_in_order() {
        let recorder = Arc::new(RecordingInvoker::default());
        let actions: Vec<CallOptionsAction> = vec![
            Arc::new(|_: &MethodDescriptor, options: &mut CallOptions| {
                options.headers_mut().insert("x-step", "1")
            }),
            Arc::new(|_: &MethodDescriptor, options: &mut CallOptions| {
                options.headers_mut().insert("x-step", "2")
            }),
            Arc::new(|m: &MethodDescriptor, options: &mut CallOptions| {
                options.headers_mut().insert("x-method", m.path())
            }),
        ];
        let invoker = CallOptionsConfigurationInvoker::new(recorder.clone(), actions);

        let call = invoker.start_call(&method(), None, CallOptions::new(), CallRequest::Stream);
        assert_eq!(call.status().unwrap().message(), Some("recorded"));

        let seen = recorder.seen.lock();
        let headers = seen[0].headers();
        assert_eq!(headers.get_all("x-step").unwrap(), &["1".to_string(), "2".to_string()]);
        assert_eq!(headers.get("x-method"), Some("/svc/M"));
    }
}
