//! Domain types shared by the scheduler, launcher and API.

pub mod stream;

pub use stream::{Destination, Platform, StreamDefinition, StreamSource, StreamStatus, StreamUpdate};
