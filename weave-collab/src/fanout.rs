//! Cross-instance event fan-out through a pub/sub broker.
//!
//! ```text
//!  instance A                 broker channel               instance B
//!  emit(env) ── publish ──►  weave:broadcast  ──► recv ──► deliver_local
//!      ▲                           │
//!      └──── recv ◄────────────────┘   (the publisher hears itself too)
//! ```
//!
//! With a live broker an instance never delivers directly: its own sockets
//! receive the event through its own subscription, like everyone else's.
//! Without one, or when publishing fails, delivery is local only.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{Delivery, RoomManager};
use crate::protocol::BroadcastEnvelope;

pub const DEFAULT_FANOUT_CHANNEL: &str = "weave:broadcast";
pub const DEFAULT_PUBLISH_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker channel closed")]
    Closed,
}

/// Minimal pub/sub surface the bridge needs.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>, BrokerError>;
}

/// In-process broker. Several instances sharing one `MemoryBroker` behave
/// like several processes sharing a Redis channel.
pub struct MemoryBroker {
    channels: RwLock<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
    available: AtomicBool,
    buffer: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_buffer(1024)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            buffer: buffer.max(1),
        }
    }

    /// Simulate an outage: while unavailable, publish and subscribe fail.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.read().await.get(channel).map_or(0, Vec::len)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker offline".into()))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.check_available()?;
        let subscribers: Vec<mpsc::Sender<Vec<u8>>> = self
            .channels
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default();
        for tx in &subscribers {
            // A closed receiver is a departed subscriber; prune below.
            let _ = tx.send(payload.clone()).await;
        }
        if subscribers.iter().any(mpsc::Sender::is_closed) {
            if let Some(list) = self.channels.write().await.get_mut(channel) {
                list.retain(|tx| !tx.is_closed());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>, BrokerError> {
        self.check_available()?;
        let (tx, rx) = mpsc::channel(self.buffer);
        self.channels
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub channel: String,
    /// Extra attempts after the first failed publish.
    pub publish_retries: u32,
    /// Emit the hyphenated legacy name alongside each namespaced event.
    pub emit_legacy_aliases: bool,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_FANOUT_CHANNEL.to_string(),
            publish_retries: DEFAULT_PUBLISH_RETRIES,
            emit_legacy_aliases: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub published: u64,
    pub received: u64,
    pub local_fallbacks: u64,
    pub decode_failures: u64,
}

struct AtomicFanoutStats {
    published: AtomicU64,
    received: AtomicU64,
    local_fallbacks: AtomicU64,
    decode_failures: AtomicU64,
}

impl AtomicFanoutStats {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            received: AtomicU64::new(0),
            local_fallbacks: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
        }
    }
}

pub struct FanoutBridge {
    instance_id: String,
    config: FanoutConfig,
    rooms: Arc<RoomManager>,
    broker: Option<Arc<dyn Broker>>,
    subscribed: AtomicBool,
    stats: AtomicFanoutStats,
}

impl FanoutBridge {
    /// Bridge with no broker: every emission is delivered in-process.
    pub fn local_only(rooms: Arc<RoomManager>, config: FanoutConfig) -> Self {
        Self::build(rooms, config, None)
    }

    /// Bridge publishing through `broker`. Call [`FanoutBridge::start`] before use.
    pub fn with_broker(rooms: Arc<RoomManager>, config: FanoutConfig, broker: Arc<dyn Broker>) -> Self {
        Self::build(rooms, config, Some(broker))
    }

    fn build(rooms: Arc<RoomManager>, config: FanoutConfig, broker: Option<Arc<dyn Broker>>) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            config,
            rooms,
            broker,
            subscribed: AtomicBool::new(false),
            stats: AtomicFanoutStats::new(),
        }
    }

    /// Subscribe to the fan-out channel and spawn the receive loop.
    ///
    /// A failed subscription leaves the bridge local-only; so does the
    /// subscription closing later.
    pub async fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let broker = self.broker.as_ref()?;
        let mut rx = match broker.subscribe(&self.config.channel).await {
            Ok(rx) => rx,
            Err(e) => {
                log::warn!(
                    "Fanout subscription to {} failed, running local-only: {e}",
                    self.config.channel
                );
                return None;
            }
        };
        self.subscribed.store(true, Ordering::SeqCst);
        log::info!(
            "Fanout instance {} subscribed to {}",
            self.instance_id,
            self.config.channel
        );

        let bridge = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                bridge.stats.received.fetch_add(1, Ordering::Relaxed);
                match BroadcastEnvelope::decode(&bytes) {
                    Ok(envelope) => bridge.deliver_local(&envelope).await,
                    Err(e) => {
                        bridge.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Skipping undecodable fanout envelope: {e}");
                    }
                }
            }
            bridge.subscribed.store(false, Ordering::SeqCst);
            log::warn!(
                "Fanout subscription to {} closed, running local-only",
                bridge.config.channel
            );
        }))
    }

    pub fn is_distributed(&self) -> bool {
        self.broker.is_some() && self.subscribed.load(Ordering::SeqCst)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn emit_legacy_aliases(&self) -> bool {
        self.config.emit_legacy_aliases
    }

    /// Route an event to its room on every instance.
    pub async fn emit(&self, envelope: BroadcastEnvelope) {
        if let Some(broker) = self.broker.as_ref().filter(|_| self.is_distributed()) {
            match envelope.encode() {
                Ok(bytes) => match self.publish_with_retries(broker.as_ref(), bytes).await {
                    Ok(()) => {
                        self.stats.published.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    Err(e) => log::warn!(
                        "Publishing {:?} for room {} failed, delivering locally: {e}",
                        envelope.event,
                        envelope.room
                    ),
                },
                Err(e) => log::warn!("Encoding fanout envelope failed, delivering locally: {e}"),
            }
            self.stats.local_fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        self.deliver_local(&envelope).await;
    }

    async fn publish_with_retries(&self, broker: &dyn Broker, bytes: Vec<u8>) -> Result<(), BrokerError> {
        let mut attempt = 0;
        loop {
            match broker.publish(&self.config.channel, bytes.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.config.publish_retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    log::debug!("Publish attempt {attempt} failed: {e}");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                }
            }
        }
    }

    /// Hand an event to this instance's members of its room.
    pub async fn deliver_local(&self, envelope: &BroadcastEnvelope) {
        let Some(group) = self.rooms.get(&envelope.room).await else {
            log::trace!("No local members in room {}", envelope.room);
            return;
        };
        match envelope.render(self.config.emit_legacy_aliases) {
            Ok(frames) => {
                let delivery = Delivery::new(frames, envelope.exclude_origin_id.clone());
                group.broadcast(Arc::new(delivery));
            }
            Err(e) => log::warn!("Dropping unrenderable {:?} event: {e}", envelope.event),
        }
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            published: self.stats.published.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            local_fallbacks: self.stats.local_fallbacks.load(Ordering::Relaxed),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
        }
    }
}
