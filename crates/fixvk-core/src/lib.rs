pub mod arena;
pub mod config;
pub mod error;

pub use arena::{Arena, ArenaId};
pub use config::FixvkConfig;
pub use error::CoreError;
