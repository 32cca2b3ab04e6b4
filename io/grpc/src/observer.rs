//! Call lifecycle observation.
//!
//! Channels report call events to a [`CallObserver`] supplied through
//! [`ChannelOptions`](crate::ChannelOptions). Nothing is recorded globally.

use crate::method::MethodDescriptor;
use crate::status::{Code, Status};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub trait CallObserver: Send + Sync {
    fn call_started(&self, _method: &MethodDescriptor) {}

    fn call_completed(&self, _method: &MethodDescriptor, _status: &Status, _elapsed: Duration) {}

    fn message_sent(&self, _method: &MethodDescriptor) {}

    fn message_received(&self, _method: &MethodDescriptor) {}
}

/// Logs call lifecycle events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl CallObserver for TracingObserver {
    fn call_started(&self, method: &MethodDescriptor) {
        tracing::debug!(method = %method, "call started");
    }

    fn call_completed(&self, method: &MethodDescriptor, status: &Status, elapsed: Duration) {
        if status.is_ok() {
            tracing::debug!(method = %method, elapsed_us = elapsed.as_micros() as u64, "call completed");
        } else {
            tracing::debug!(
                method = %method,
                status = %status.code(),
                message = status.message().unwrap_or(""),
                elapsed_us = elapsed.as_micros() as u64,
                "call failed"
            );
        }
    }
}

/// Atomic counters over every call on the channels it is attached to.
#[derive(Debug, Default)]
pub struct CallCounters {
    total: AtomicU64,
    current: AtomicU64,
    failed: AtomicU64,
    deadline_exceeded: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// Point-in-time copy of [`CallCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCountersSnapshot {
    pub total: u64,
    pub current: u64,
    pub failed: u64,
    pub deadline_exceeded: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl CallCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> CallCountersSnapshot {
        CallCountersSnapshot {
            total: self.total.load(Ordering::Relaxed),
            current: self.current.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deadline_exceeded: self.deadline_exceeded.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

impl CallObserver for CallCounters {
    fn call_started(&self, _method: &MethodDescriptor) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    fn call_completed(&self, _method: &MethodDescriptor, status: &Status, _elapsed: Duration) {
        self.current.fetch_sub(1, Ordering::Relaxed);
        if !status.is_ok() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if status.code() == Code::DeadlineExceeded {
            self.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn message_sent(&self, _method: &MethodDescriptor) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn message_received(&self, _method: &MethodDescriptor) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fans events out to several observers.
pub struct ObserverSet(pub Vec<Arc<dyn CallObserver>>);

impl CallObserver for ObserverSet {
    fn call_started(&self, method: &MethodDescriptor) {
        self.0.iter().for_each(|o| o.call_started(method));
    }

    fn call_completed(&self, method: &MethodDescriptor, status: &Status, elapsed: Duration) {
        self.0.iter().for_each(|o| o.call_completed(method, status, elapsed));
    }

    fn message_sent(&self, method: &MethodDescriptor) {
        self.0.iter().for_each(|o| o.message_sent(method));
    }

    fn message_received(&self, method: &MethodDescriptor) {
        self.0.iter().for_each(|o| o.message_received(method));
    }
}
