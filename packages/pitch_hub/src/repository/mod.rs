// Repository layer. Each storage concern lives in its own file with `impl HubRepository`.

use sqlx::sqlite::SqlitePool;

mod offline_queue;

pub use offline_queue::queue_key;

#[cfg(test)]
pub(crate) mod test_helpers;

#[derive(Clone)]
pub struct HubRepository {
    pub(crate) pool: SqlitePool,
}

impl HubRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}
