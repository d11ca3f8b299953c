use anyhow::Result;
use sqlx::Row;

use super::HubRepository;

/// Storage key for a user's backlog.
pub fn queue_key(user_id: &str) -> String {
    format!("queue:{}", user_id)
}

impl HubRepository {
    /// The raw JSON array stored under `key`, if any.
    pub async fn load_queue(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT messages FROM offline_queues WHERE user_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("messages")))
    }

    pub async fn store_queue(&self, key: &str, messages: &str, count: usize) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO offline_queues (user_key, messages, message_count, updated_at) VALUES (?, ?, ?, unixepoch())",
        )
        .bind(key)
        .bind(messages)
        .bind(count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_queue(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM offline_queues WHERE user_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Messages waiting across every user.
    pub async fn queued_total(&self) -> Result<u64> {
        let total: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(message_count), 0) FROM offline_queues")
                .fetch_one(&self.pool)
                .await?;
        Ok(total as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::queue_key;
    use crate::repository::test_helpers;

    #[test]
    fn key_is_namespaced() {
        assert_eq!(queue_key("u-1"), "queue:u-1");
    }

    #[tokio::test]
    async fn load_missing_queue() {
        let repo = test_helpers::test_repository().await;
        assert!(repo.load_queue("queue:nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_replaces_previous_value() {
        let repo = test_helpers::test_repository().await;
        repo.store_queue("queue:u1", "[1]", 1).await.unwrap();
        repo.store_queue("queue:u1", "[1,2]", 2).await.unwrap();

        assert_eq!(repo.load_queue("queue:u1").await.unwrap().unwrap(), "[1,2]");
        assert_eq!(repo.queued_total().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_and_total() {
        let repo = test_helpers::test_repository().await;
        repo.store_queue("queue:a", "[]", 3).await.unwrap();
        repo.store_queue("queue:b", "[]", 5).await.unwrap();
        assert_eq!(repo.queued_total().await.unwrap(), 8);

        repo.delete_queue("queue:a").await.unwrap();
        assert!(repo.load_queue("queue:a").await.unwrap().is_none());
        assert_eq!(repo.queued_total().await.unwrap(), 5);

        // Deleting twice is fine
        repo.delete_queue("queue:a").await.unwrap();
    }
}
