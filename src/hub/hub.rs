//! Subscriber registry and non-blocking publish path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event::{Channel, HubEvent, SubscriberIdentity};
use crate::config::HubConfig;
use crate::error::HubError;
use crate::metrics::MetricsCollector;

struct Subscriber {
    identity: SubscriberIdentity,
    channels: HashSet<Channel>,
    tx: mpsc::Sender<HubEvent>,
    last_heartbeat: Instant,
}

/// Receiving end of a subscription.
///
/// The stream ends when the subscription is removed (unsubscribe, heartbeat
/// expiry or overflow). Events already buffered are still delivered.
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub channels: Vec<Channel>,
    pub connected_at: DateTime<Utc>,
    rx: mpsc::Receiver<HubEvent>,
}

impl SubscriptionHandle {
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }

    /// Adapts the subscription for a transport that consumes streams.
    pub fn into_stream(self) -> ReceiverStream<HubEvent> {
        ReceiverStream::new(self.rx)
    }
}

/// What one publish did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscriptions disconnected because their buffer was full.
    pub overflowed: Vec<Uuid>,
    /// Subscriptions dropped because their receiver was gone.
    pub closed: Vec<Uuid>,
}

/// Cumulative hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub overflowed: u64,
    pub expired: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    overflowed: AtomicU64,
    expired: AtomicU64,
}

/// Multiplexes events to many subscribers without blocking producers.
///
/// Each subscriber owns a bounded buffer. `publish` only ever uses
/// `try_send`; a subscriber whose buffer is full is disconnected with
/// `SubscriberOverflow` instead of stalling the publisher or its peers.
/// Publishes are serialized, so every subscription sees events in publish
/// order.
pub struct FanoutHub {
    config: HubConfig,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    counters: Counters,
    metrics: MetricsCollector,
}

impl FanoutHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            subscribers: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Registers interest in `channels`, narrowed to what the identity is
    /// allowed to see.
    pub fn subscribe(
        &self,
        identity: SubscriberIdentity,
        channels: &[Channel],
    ) -> Result<SubscriptionHandle, HubError> {
        let granted: HashSet<Channel> = channels
            .iter()
            .copied()
            .filter(|c| identity.allowed_channels.contains(c))
            .collect();

        if granted.is_empty() {
            return Err(HubError::NoAuthorizedChannels(identity.user_id));
        }

        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        let id = Uuid::new_v4();
        let mut ordered: Vec<Channel> = granted.iter().copied().collect();
        ordered.sort_by_key(|c| c.as_str());

        info!(
            subscription_id = %id,
            user_id = %identity.user_id,
            channels = ?ordered,
            "Subscriber connected"
        );

        let count = {
            let mut subscribers = self.lock();
            subscribers.insert(
                id,
                Subscriber {
                    identity,
                    channels: granted,
                    tx,
                    last_heartbeat: Instant::now(),
                },
            );
            subscribers.len()
        };
        self.metrics.update_hub_subscribers(count);

        Ok(SubscriptionHandle {
            id,
            channels: ordered,
            connected_at: Utc::now(),
            rx,
        })
    }

    pub fn unsubscribe(&self, id: Uuid) -> Result<(), HubError> {
        let (removed, count) = {
            let mut subscribers = self.lock();
            (subscribers.remove(&id), subscribers.len())
        };
        self.metrics.update_hub_subscribers(count);

        match removed {
            Some(sub) => {
                info!(subscription_id = %id, user_id = %sub.identity.user_id, "Subscriber disconnected");
                Ok(())
            }
            None => Err(HubError::SubscriptionNotFound(id)),
        }
    }

    /// Refreshes a subscription's liveness.
    pub fn heartbeat(&self, id: Uuid) -> Result<(), HubError> {
        match self.lock().get_mut(&id) {
            Some(sub) => {
                sub.last_heartbeat = Instant::now();
                Ok(())
            }
            None => Err(HubError::SubscriptionNotFound(id)),
        }
    }

    /// Delivers `event` to every subscription listening on its channel that
    /// may see it. Never waits.
    pub fn publish(&self, event: &HubEvent) -> PublishReport {
        let mut report = PublishReport::default();

        let count = {
            let mut subscribers = self.lock();

            for (id, sub) in subscribers.iter() {
                if !sub.channels.contains(&event.channel)
                    || !sub.identity.can_see(event.user_id.as_deref())
                {
                    continue;
                }

                match sub.tx.try_send(event.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => report.overflowed.push(*id),
                    Err(mpsc::error::TrySendError::Closed(_)) => report.closed.push(*id),
                }
            }

            for id in report.overflowed.iter().chain(report.closed.iter()) {
                subscribers.remove(id);
            }
            subscribers.len()
        };

        for id in &report.overflowed {
            let err = HubError::SubscriberOverflow {
                subscription_id: *id,
                capacity: self.config.subscriber_buffer,
            };
            warn!(subscription_id = %id, error = %err, "Disconnecting slow subscriber");
            self.metrics.inc_subscriber_overflow();
        }
        for id in &report.closed {
            debug!(subscription_id = %id, "Dropping subscriber with closed receiver");
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.counters
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .overflowed
            .fetch_add(report.overflowed.len() as u64, Ordering::Relaxed);
        if !report.overflowed.is_empty() || !report.closed.is_empty() {
            self.metrics.update_hub_subscribers(count);
        }

        report
    }

    /// Removes subscriptions whose last heartbeat is older than the timeout.
    pub fn expire_stale(&self) -> Vec<Uuid> {
        let timeout = self.config.heartbeat_timeout;
        let now = Instant::now();

        let (expired, count) = {
            let mut subscribers = self.lock();
            let expired: Vec<Uuid> = subscribers
                .iter()
                .filter(|(_, sub)| now.duration_since(sub.last_heartbeat) >= timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                subscribers.remove(id);
            }
            (expired, subscribers.len())
        };

        if !expired.is_empty() {
            info!(expired = expired.len(), "Expired stale subscriptions");
            self.counters
                .expired
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            self.metrics.update_hub_subscribers(count);
        }
        expired
    }

    /// Runs `expire_stale` every sweep interval until `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        hub.expire_stale();
                    }
                }
            }
            debug!("Heartbeat sweeper stopped");
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            subscribers: self.subscriber_count(),
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            overflowed: self.counters.overflowed.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventType;
    use std::time::Duration;

    fn hub(buffer: usize) -> FanoutHub {
        FanoutHub::new(HubConfig {
            subscriber_buffer: buffer,
            heartbeat_timeout: Duration::from_millis(50),
            ..Default::default()
        })
    }

    fn job_event(n: u64) -> HubEvent {
        HubEvent::new(EventType::ProgressUpdate, Channel::Jobs)
            .with_metadata("seq", serde_json::json!(n))
    }

    #[tokio::test]
    async fn test_delivery_preserves_publish_order() {
        let hub = hub(64);
        let mut sub = hub
            .subscribe(SubscriberIdentity::user("u-1"), &[Channel::Jobs])
            .unwrap();

        for n in 0..20 {
            hub.publish(&job_event(n));
        }

        for n in 0..20 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.metadata["seq"], n);
        }
    }

    #[tokio::test]
    async fn test_channel_and_user_filtering() {
        let hub = hub(8);
        let mut alice = hub
            .subscribe(SubscriberIdentity::user("alice"), &[Channel::Jobs])
            .unwrap();
        let mut ops = hub
            .subscribe(SubscriberIdentity::admin("ops"), &[Channel::Jobs, Channel::System])
            .unwrap();

        hub.publish(&job_event(1).with_user("bob"));
        hub.publish(&HubEvent::system(EventType::SystemSnapshot, "tick"));
        hub.publish(&job_event(2).with_user("alice"));

        assert_eq!(alice.try_recv().unwrap().metadata["seq"], 2);
        assert!(alice.try_recv().is_none());

        assert_eq!(ops.try_recv().unwrap().metadata["seq"], 1);
        assert_eq!(ops.try_recv().unwrap().channel, Channel::System);
        assert_eq!(ops.try_recv().unwrap().metadata["seq"], 2);
    }

    #[test]
    fn test_unauthorized_channels_rejected() {
        let hub = hub(8);
        let err = hub
            .subscribe(SubscriberIdentity::user("alice"), &[Channel::System])
            .err()
            .unwrap();
        assert!(matches!(err, HubError::NoAuthorizedChannels(_)));

        let sub = hub
            .subscribe(
                SubscriberIdentity::user("alice"),
                &[Channel::System, Channel::Notifications],
            )
            .unwrap();
        assert_eq!(sub.channels, vec![Channel::Notifications]);
    }

    #[tokio::test]
    async fn test_overflow_disconnects_only_slow_subscriber() {
        let hub = hub(2);
        let mut slow = hub
            .subscribe(SubscriberIdentity::user("slow"), &[Channel::Jobs])
            .unwrap();
        let mut fast = hub
            .subscribe(SubscriberIdentity::user("fast"), &[Channel::Jobs])
            .unwrap();

        let mut overflowed = Vec::new();
        for n in 0..5 {
            let report = hub.publish(&job_event(n));
            overflowed.extend(report.overflowed);
            // Keep the fast subscriber drained.
            assert_eq!(fast.recv().await.unwrap().metadata["seq"], n);
        }

        assert_eq!(overflowed, vec![slow.id]);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.stats().overflowed, 1);

        // The slow subscriber gets what fit in its buffer, then the end.
        assert_eq!(slow.recv().await.unwrap().metadata["seq"], 0);
        assert_eq!(slow.recv().await.unwrap().metadata["seq"], 1);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_affect_others() {
        let hub = hub(8);
        let gone = hub
            .subscribe(SubscriberIdentity::user("gone"), &[Channel::Jobs])
            .unwrap();
        let mut stays = hub
            .subscribe(SubscriberIdentity::user("stays"), &[Channel::Jobs])
            .unwrap();

        hub.publish(&job_event(0));
        drop(gone);
        let report = hub.publish(&job_event(1));

        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(stays.recv().await.unwrap().metadata["seq"], 0);
        assert_eq!(stays.recv().await.unwrap().metadata["seq"], 1);
    }

    #[tokio::test]
    async fn test_heartbeat_expiry() {
        let hub = hub(8);
        let stale = hub
            .subscribe(SubscriberIdentity::user("stale"), &[Channel::Jobs])
            .unwrap();
        let live = hub
            .subscribe(SubscriberIdentity::user("live"), &[Channel::Jobs])
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        hub.heartbeat(live.id).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let expired = hub.expire_stale();
        assert_eq!(expired, vec![stale.id]);
        assert_eq!(hub.subscriber_count(), 1);
        assert!(matches!(
            hub.heartbeat(stale.id),
            Err(HubError::SubscriptionNotFound(_))
        ));
        assert!(hub.unsubscribe(live.id).is_ok());
        assert!(hub.unsubscribe(live.id).is_err());
    }
}
