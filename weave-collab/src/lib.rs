//! # weave-collab: Real-time project rooms for Weave
//!
//! JSON-over-WebSocket gateway that lets many users edit one prompt graph
//! together, with optional fan-out across server instances.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐     ┌────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │────►│ GraphStore │
//! │ (per user)  │     JSON frames     │ SyncGateway │     └────────────┘
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐      ┌────────┐
//!                                    │ FanoutBridge  │◄────►│ Broker │
//!                                    └───────┬───────┘      └────────┘
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (per room)    │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: client/server frames, event alias table, broker envelope
//! - [`gateway`]: per-socket request handling
//! - [`presence`]: who is in which room
//! - [`broadcast`]: room-based fan-out with backpressure
//! - [`fanout`]: cross-instance delivery through a broker
//! - [`store`]: persistence collaborator
//! - [`auth`]: connection authentication
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with offline queue

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod fanout;
pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, Identity, StaticTokenAuthenticator};
pub use broadcast::{BroadcastGroup, BroadcastStats, Delivery, RoomManager};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent, TokenPlacement};
pub use fanout::{Broker, BrokerError, FanoutBridge, FanoutConfig, FanoutStats, MemoryBroker};
pub use gateway::{Connection, GatewayError, SyncGateway};
pub use presence::{PresenceEntry, PresenceRegistry};
pub use protocol::{
    BroadcastEnvelope, ClientFrame, ClientMessage, EventKind, NodeInput, NodePatch, ProtocolError,
    ServerFrame,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use store::{GraphStore, MemoryStore, StoreError};
