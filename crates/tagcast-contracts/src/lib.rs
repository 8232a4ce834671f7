pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod message;
pub mod placeholders;
pub mod processing;
pub mod tags;
pub mod tree;

pub use error::MediaError;
