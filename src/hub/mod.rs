//! Real-time fan-out of job, system and notification events.
//!
//! Transports (WebSocket, SSE, ...) are outside this crate: they subscribe
//! with a verified [`SubscriberIdentity`], forward whatever arrives on the
//! [`SubscriptionHandle`] and call `heartbeat` while the connection lives.

pub mod event;
#[allow(clippy::module_inception)]
pub mod hub;

pub use event::{Channel, EventType, HubEvent, SubscriberIdentity};
pub use hub::{FanoutHub, HubStats, PublishReport, SubscriptionHandle};
