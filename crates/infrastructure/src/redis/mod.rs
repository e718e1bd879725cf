//! Redis Pub/Sub 广播总线

pub mod bus;
pub mod error;

pub use bus::RedisMessageBus;
pub use error::{RedisError, RedisResult};
