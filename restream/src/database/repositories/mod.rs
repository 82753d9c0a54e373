//! Repository traits and their SQLx implementations.

pub mod stream;

pub use stream::{SqlxStreamRepository, StreamRepository};
