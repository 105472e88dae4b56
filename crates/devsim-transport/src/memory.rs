//! In-memory loopback broker
//!
//! Routes PUBLISH to every live session whose filters match, the publisher
//! included, the way a real broker echoes a device's own topic back to an
//! `mqtt/#` subscriber. Used by tests and by the node's offline mode.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use devsim_core::{DeviceError, DeviceResult};
use devsim_wire::{topic_matches, validate_filter, validate_topic, ConnAck, ConnectReturnCode};

use crate::{BrokerHandler, BrokerSession, BrokerTransport, ConnectOptions};

/// A broker living in process memory. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    sessions: Mutex<Vec<Weak<MemorySession>>>,
    published: Mutex<Vec<(String, Bytes)>>,
    refuse: AtomicBool,
    connections: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new connections with "server unavailable"
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of accepted connections since creation
    pub fn connection_count(&self) -> u64 {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Every message the broker accepted, in order
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.inner.published.lock().clone()
    }

    pub fn published_count(&self) -> usize {
        self.inner.published.lock().len()
    }

    /// Sessions neither halted, severed nor dropped
    pub fn live_sessions(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| s.is_alive())
            .count()
    }

    /// Drop every session from the broker side
    pub fn sever_all(&self) {
        for session in self.inner.sessions.lock().iter().filter_map(Weak::upgrade) {
            session.severed.store(true, Ordering::SeqCst);
        }
    }

    /// Deliver a message as if another client had published it
    pub fn publish_external(&self, topic: &str, payload: impl Into<Bytes>) -> DeviceResult<()> {
        validate_topic(topic)?;
        self.inner.route(topic, payload.into());
        Ok(())
    }
}

impl BrokerInner {
    fn route(&self, topic: &str, payload: Bytes) {
        self.published.lock().push((topic.to_string(), payload.clone()));

        let targets: Vec<Arc<MemorySession>> = {
            let mut sessions = self.sessions.lock();
            sessions.retain(|s| s.strong_count() > 0);
            sessions
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|s| s.is_alive() && s.subscribed_to(topic))
                .collect()
        };

        for session in targets {
            session.handler.on_message(topic, &payload);
        }
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn connect(
        &self,
        options: &ConnectOptions,
        handler: Arc<dyn BrokerHandler>,
    ) -> DeviceResult<Arc<dyn BrokerSession>> {
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(DeviceError::ConnectionRefused(
                ConnectReturnCode::ServerUnavailable.to_byte(),
            ));
        }
        self.inner.connections.fetch_add(1, Ordering::SeqCst);

        let filters = handler
            .on_connect(&ConnAck::accepted())
            .into_iter()
            .filter(|f| match validate_filter(f) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Rejecting filter from {}: {}", options.client_id, e);
                    false
                }
            })
            .collect();

        let session = Arc::new(MemorySession {
            broker: Arc::downgrade(&self.inner),
            handler,
            filters,
            client_id: options.client_id.clone(),
            halted: AtomicBool::new(false),
            severed: AtomicBool::new(false),
        });
        self.inner.sessions.lock().push(Arc::downgrade(&session));
        tracing::debug!("Memory broker accepted {}", session.client_id);

        Ok(session)
    }
}

/// A session on a [`MemoryBroker`]
pub struct MemorySession {
    broker: Weak<BrokerInner>,
    handler: Arc<dyn BrokerHandler>,
    filters: Vec<String>,
    client_id: String,
    halted: AtomicBool,
    severed: AtomicBool,
}

impl MemorySession {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn subscribed_to(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| topic_matches(f, topic))
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn publish(&self, topic: &str, payload: Bytes) -> DeviceResult<()> {
        if !self.is_alive() {
            return Err(DeviceError::LinkDown);
        }
        validate_topic(topic)?;
        let broker = self.broker.upgrade().ok_or(DeviceError::LinkDown)?;
        broker.route(topic, payload);
        Ok(())
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        !self.halted.load(Ordering::SeqCst) && !self.severed.load(Ordering::SeqCst)
    }
}
