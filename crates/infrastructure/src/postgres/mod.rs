//! Postgres 适配器：消息存储与成员关系查询

pub mod membership;
pub mod message_store;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};

pub use membership::PgMembershipGate;
pub use message_store::PgMessageStore;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
