//! Database row models.

pub mod stream;

pub use stream::StreamDbModel;
