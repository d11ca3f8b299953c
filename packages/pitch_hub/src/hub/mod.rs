//! The real-time notification and presence hub.
//!
//! One actor ([`actor::HubActor`]) owns all mutable hub state and handles one
//! event at a time. Connection tasks ([`handler`]) and the admin endpoints
//! talk to it through a [`actor::HubHandle`].

pub mod actor;
pub mod channels;
pub mod handler;
pub mod hibernation;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod router;
pub mod state;
pub mod transport;
