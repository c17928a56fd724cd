//! Event payload contract for real-time subscribers.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::{Job, JobStatus};

/// Logical stream an event is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Job lifecycle and progress.
    Jobs,
    /// Backend health and periodic snapshots.
    System,
    /// Human-facing notices (degradation, abandonment, recovery).
    Notifications,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Jobs, Channel::System, Channel::Notifications];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Jobs => "jobs",
            Channel::System => "system",
            Channel::Notifications => "notifications",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    JobQueued,
    ProgressUpdate,
    JobCompleted,
    JobFailed,
    DegradedNotice,
    SystemSnapshot,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobQueued => "job-queued",
            EventType::ProgressUpdate => "progress-update",
            EventType::JobCompleted => "job-completed",
            EventType::JobFailed => "job-failed",
            EventType::DegradedNotice => "degraded-notice",
            EventType::SystemSnapshot => "system-snapshot",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    pub event_type: EventType,
    pub channel: Channel,
    #[serde(default)]
    pub job_id: Option<Uuid>,
    /// When set, only this user (and admins) receive the event.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl HubEvent {
    pub fn new(event_type: EventType, channel: Channel) -> Self {
        Self {
            event_type,
            channel,
            job_id: None,
            user_id: None,
            status: None,
            progress: None,
            message: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// A `jobs` channel event describing the current state of `job`.
    pub fn for_job(event_type: EventType, job: &Job) -> Self {
        let mut event = Self::new(event_type, Channel::Jobs);
        event.job_id = Some(job.id);
        event.user_id = job.spec.user_id.clone();
        event.status = Some(job.status);
        event.progress = Some(job.progress);
        event.metadata.insert(
            "lane".to_string(),
            serde_json::Value::String(job.lane().to_string()),
        );
        if let serde_json::Value::Object(map) = job.metadata() {
            event.metadata.extend(map);
        }
        event
    }

    /// A `notifications` channel event about `job`.
    pub fn notification(event_type: EventType, job: &Job, message: impl Into<String>) -> Self {
        Self::for_job(event_type, job)
            .on_channel(Channel::Notifications)
            .with_message(message)
    }

    /// A `system` channel event.
    pub fn system(event_type: EventType, message: impl Into<String>) -> Self {
        Self::new(event_type, Channel::System).with_message(message)
    }

    pub fn on_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Verified identity attached to a subscription by the session layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberIdentity {
    pub user_id: String,
    /// Channels this identity may listen on.
    pub allowed_channels: HashSet<Channel>,
    /// Admins see events of every user.
    #[serde(default)]
    pub is_admin: bool,
}

impl SubscriberIdentity {
    /// A regular user allowed on `jobs` and `notifications`.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            allowed_channels: [Channel::Jobs, Channel::Notifications].into_iter().collect(),
            is_admin: false,
        }
    }

    /// An operator allowed on every channel and every user's events.
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            allowed_channels: Channel::ALL.into_iter().collect(),
            is_admin: true,
        }
    }

    /// Whether an event addressed to `user_id` is visible to this identity.
    pub fn can_see(&self, user_id: Option<&str>) -> bool {
        match user_id {
            None => true,
            Some(owner) => self.is_admin || owner == self.user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{JobKind, JobSpec};

    #[test]
    fn test_event_wire_format() {
        let event = HubEvent::system(EventType::SystemSnapshot, "tick")
            .with_metadata("in_flight", serde_json::json!(3));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event_type"], "system-snapshot");
        assert_eq!(json["channel"], "system");
        assert_eq!(json["message"], "tick");
        assert_eq!(json["metadata"]["in_flight"], 3);
    }

    #[test]
    fn test_for_job_carries_state() {
        let job = Job::new(JobSpec::new(JobKind::Image, "x").with_user("u-1"));
        let event = HubEvent::for_job(EventType::JobQueued, &job);

        assert_eq!(event.channel, Channel::Jobs);
        assert_eq!(event.job_id, Some(job.id));
        assert_eq!(event.user_id.as_deref(), Some("u-1"));
        assert_eq!(event.status, Some(JobStatus::Queued));
        assert_eq!(event.metadata["lane"], "interactive");
    }

    #[test]
    fn test_identity_visibility() {
        let user = SubscriberIdentity::user("u-1");
        assert!(user.can_see(None));
        assert!(user.can_see(Some("u-1")));
        assert!(!user.can_see(Some("u-2")));
        assert!(!user.allowed_channels.contains(&Channel::System));

        let admin = SubscriberIdentity::admin("ops");
        assert!(admin.can_see(Some("u-2")));
        assert!(admin.allowed_channels.contains(&Channel::System));
    }
}
