pub mod budget;
pub mod config;
pub mod lru;

pub use budget::*;
pub use config::*;
pub use lru::*;
