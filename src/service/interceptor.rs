//! Socket-layer boundary.
//!
//! The capture layer reports connections as they appear and disappear and
//! hands over every sent and received buffer. The [`Interceptor`] owns one
//! pipeline, one [`ConnectionState`] and two [`StreamTunnel`]s per
//! connection, and returns the bytes that should actually go on the wire.
//!
//! Calls for the same connection are expected to arrive serially; calls for
//! different connections may run in parallel. Handlers must not call back
//! into the interceptor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, instrument};

use crate::config::ConfigProvider;
use crate::core::codec::BundleCodec;
use crate::protocol::mitigator::{KeepAliveSampler, LatencyMitigator};
use crate::protocol::pipeline::{Direction, MessagePipeline, OwnerId, Subscription};
use crate::protocol::state::{ConnectionId, ConnectionState};
use crate::service::tunnel::StreamTunnel;
use crate::utils::compression::{Compressors, StreamCompressor};
use crate::utils::metrics::Metrics;
use crate::utils::time::{Clock, MonotonicClock};

type CompressorFactory = dyn Fn() -> Box<dyn StreamCompressor> + Send + Sync;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ConnectionIo {
    state: ConnectionState,
    send: StreamTunnel,
    recv: StreamTunnel,
}

struct Connection {
    owner: OwnerId,
    pipeline: MessagePipeline,
    io: Mutex<ConnectionIo>,
    mitigation: Mutex<Vec<Subscription>>,
    _sampler: Vec<Subscription>,
}

/// Entry point for the socket interception layer.
pub struct Interceptor {
    config: Arc<ConfigProvider>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    mitigator: Arc<LatencyMitigator>,
    sampler: Arc<KeepAliveSampler>,
    proprietary: Option<Arc<CompressorFactory>>,
    mitigation_enabled: AtomicBool,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("connections", &self.connection_count())
            .field("mitigation_enabled", &self.is_mitigation_enabled())
            .field("proprietary", &self.proprietary.is_some())
            .finish()
    }
}

impl Interceptor {
    pub fn new(config: Arc<ConfigProvider>) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: Arc<ConfigProvider>, clock: Arc<dyn Clock>) -> Self {
        let metrics = Arc::new(Metrics::new());
        let enabled = config.current().mitigation.enabled;
        Self {
            mitigator: Arc::new(LatencyMitigator::new(
                Arc::clone(&config),
                Arc::clone(&metrics),
            )),
            sampler: Arc::new(KeepAliveSampler::new(Arc::clone(&config))),
            config,
            clock,
            metrics,
            proprietary: None,
            mitigation_enabled: AtomicBool::new(enabled),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Install the proprietary stream codec; one instance is created per
    /// connection direction.
    pub fn with_proprietary_codec<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn StreamCompressor> + Send + Sync + 'static,
    {
        self.proprietary = Some(Arc::new(factory));
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn config(&self) -> &Arc<ConfigProvider> {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_mitigation_enabled(&self) -> bool {
        self.mitigation_enabled.load(Ordering::SeqCst)
    }

    fn codec(&self) -> BundleCodec {
        let mut compressors = Compressors::new();
        if let Some(factory) = &self.proprietary {
            compressors = compressors.with_proprietary(factory());
        }
        BundleCodec::with_compressors(compressors)
    }

    fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        lock(&self.connections).get(&id).cloned()
    }

    /// Start tracking a connection. Returns `false` if it was already tracked.
    #[instrument(skip(self), fields(connection = %id))]
    pub fn on_connection_found(&self, id: ConnectionId) -> bool {
        let config = self.config.current();

        // held until the insert so a concurrent toggle sees this connection
        let mut connections = lock(&self.connections);
        if connections.contains_key(&id) {
            debug!("Connection already tracked");
            return false;
        }

        let pipeline = MessagePipeline::new();
        let owner = OwnerId::next();
        let sampler = self.sampler.attach(&pipeline, owner);
        let mitigation = if self.is_mitigation_enabled() {
            self.mitigator.attach(&pipeline, owner)
        } else {
            Vec::new()
        };

        let connection = Arc::new(Connection {
            owner,
            io: Mutex::new(ConnectionIo {
                state: ConnectionState::new(id, Arc::clone(&self.clock), &config.mitigation),
                send: StreamTunnel::new(Direction::Outbound, self.codec(), Arc::clone(&self.metrics)),
                recv: StreamTunnel::new(Direction::Inbound, self.codec(), Arc::clone(&self.metrics)),
            }),
            pipeline,
            mitigation: Mutex::new(mitigation),
            _sampler: sampler,
        });
        connections.insert(id, connection);
        drop(connections);

        self.metrics.connection_found();
        info!("Connection found");
        true
    }

    /// Stop tracking a connection and release its handlers and state.
    ///
    /// Returns the bytes still buffered for each direction as `(send, recv)`.
    #[instrument(skip(self), fields(connection = %id))]
    pub fn on_connection_gone(&self, id: ConnectionId) -> Option<(Vec<u8>, Vec<u8>)> {
        let connection = lock(&self.connections).remove(&id)?;
        connection.pipeline.remove_all(connection.owner);

        let mut io = lock(&connection.io);
        let leftovers = (io.send.flush().to_vec(), io.recv.flush().to_vec());
        drop(io);

        self.metrics.connection_gone();
        info!("Connection gone");
        self.metrics.log_metrics();
        Some(leftovers)
    }

    /// Process a buffer the client is sending; returns the bytes to send instead.
    pub fn on_send(&self, id: ConnectionId, data: &[u8]) -> Vec<u8> {
        self.process(id, Direction::Outbound, data)
    }

    /// Process a buffer received from the server; returns the bytes to deliver instead.
    pub fn on_recv(&self, id: ConnectionId, data: &[u8]) -> Vec<u8> {
        self.process(id, Direction::Inbound, data)
    }

    fn process(&self, id: ConnectionId, direction: Direction, data: &[u8]) -> Vec<u8> {
        let Some(connection) = self.connection(id) else {
            return data.to_vec();
        };

        let mut io = lock(&connection.io);
        let ConnectionIo { state, send, recv } = &mut *io;
        let tunnel = match direction {
            Direction::Outbound => send,
            Direction::Inbound => recv,
        };
        tunnel.process(data, &connection.pipeline, state).to_vec()
    }

    /// Feed a latency sample measured by the socket layer.
    pub fn record_latency_sample(&self, id: ConnectionId, latency_us: i64) -> bool {
        match self.connection(id) {
            Some(connection) => {
                lock(&connection.io).state.record_latency_sample(latency_us);
                true
            }
            None => false,
        }
    }

    /// Pipeline of a connection, for registering additional observers.
    pub fn pipeline(&self, id: ConnectionId) -> Option<MessagePipeline> {
        self.connection(id).map(|c| c.pipeline.clone())
    }

    /// Attach or detach the mitigator on every live connection.
    ///
    /// Toggles are serialised with each other and with connection setup, so
    /// every tracked connection ends up matching the last toggle.
    #[instrument(skip(self))]
    pub fn set_mitigation_enabled(&self, enabled: bool) {
        let connections = lock(&self.connections);
        if self.mitigation_enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }

        for connection in connections.values() {
            let mut mitigation = lock(&connection.mitigation);
            if enabled {
                *mitigation = self.mitigator.attach(&connection.pipeline, connection.owner);
            } else {
                mitigation.clear();
                drop(mitigation);
                lock(&connection.io).state.reset_mitigation();
            }
        }
        drop(connections);
        info!(enabled, "Latency mitigation toggled");
    }
}
