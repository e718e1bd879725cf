//! 进程内适配器：单实例运行与测试使用

pub mod bus;
pub mod log;
pub mod store;

pub use bus::LocalMessageBus;
pub use log::{InMemoryConsumer, InMemoryLog};
pub use store::InMemoryMessageStore;
