//! User domain events
//!
//! Events are immutable once constructed: fields are private and only
//! readable through accessors. Each one carries the common
//! [`EventMetadata`] flattened into its JSON form, so the wire layout is
//! `{"id", "type", "timestamp", "aggregate_id", ...payload}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type tags for the user events, also used as topic names
pub mod event_types {
    pub const USER_CREATED: &str = "user.created";
    pub const USER_UPDATED: &str = "user.updated";
    pub const USER_DELETED: &str = "user.deleted";
    pub const USER_LOGGED_IN: &str = "user.logged_in";
}

/// A domain event that can be published to the broker
///
/// Encoding is resolved statically per event type; the broker never inspects
/// event payloads at runtime.
pub trait DomainEvent: Send + Sync {
    fn event_type(&self) -> &str;
    fn event_id(&self) -> &str;
    fn occurred_at(&self) -> DateTime<Utc>;
    fn aggregate_id(&self) -> &str;

    /// Encode the event into its JSON wire form
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error>;
}

/// Fields shared by every domain event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMetadata {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    timestamp: DateTime<Utc>,
    aggregate_id: String,
}

impl EventMetadata {
    /// Stamp a new event of `event_type` about `aggregate_id`
    pub fn new(event_type: &str, aggregate_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            aggregate_id: aggregate_id.to_string(),
        }
    }
}

macro_rules! impl_domain_event {
    ($event:ty) => {
        impl DomainEvent for $event {
            fn event_type(&self) -> &str {
                &self.metadata.event_type
            }

            fn event_id(&self) -> &str {
                &self.metadata.id
            }

            fn occurred_at(&self) -> DateTime<Utc> {
                self.metadata.timestamp
            }

            fn aggregate_id(&self) -> &str {
                &self.metadata.aggregate_id
            }

            fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
                serde_json::to_vec(self)
            }
        }
    };
}

/// Published when a new user is created
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserCreatedEvent {
    #[serde(flatten)]
    metadata: EventMetadata,
    email: String,
    name: String,
}

impl UserCreatedEvent {
    pub fn new(user_id: Uuid, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: EventMetadata::new(event_types::USER_CREATED, user_id),
            email: email.into(),
            name: name.into(),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Published when a user's profile is updated
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserUpdatedEvent {
    #[serde(flatten)]
    metadata: EventMetadata,
    name: String,
}

impl UserUpdatedEvent {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            metadata: EventMetadata::new(event_types::USER_UPDATED, user_id),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Published when a user is deleted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserDeletedEvent {
    #[serde(flatten)]
    metadata: EventMetadata,
}

impl UserDeletedEvent {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            metadata: EventMetadata::new(event_types::USER_DELETED, user_id),
        }
    }
}

/// Published when a user logs in
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserLoggedInEvent {
    #[serde(flatten)]
    metadata: EventMetadata,
    email: String,
}

impl UserLoggedInEvent {
    pub fn new(user_id: Uuid, email: impl Into<String>) -> Self {
        Self {
            metadata: EventMetadata::new(event_types::USER_LOGGED_IN, user_id),
            email: email.into(),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }
}

impl_domain_event!(UserCreatedEvent);
impl_domain_event!(UserUpdatedEvent);
impl_domain_event!(UserDeletedEvent);
impl_domain_event!(UserLoggedInEvent);
