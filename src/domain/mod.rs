//! Domain layer: events emitted by the user service

pub mod events;

pub use events::{
    event_types, DomainEvent, EventMetadata, UserCreatedEvent, UserDeletedEvent,
    UserLoggedInEvent, UserUpdatedEvent,
};
