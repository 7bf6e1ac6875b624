//! glimmr-adapter-redis - Redis 适配器

mod connection;
mod counter_store;

pub use connection::*;
pub use counter_store::*;
