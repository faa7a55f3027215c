//! Local Registry
//!
//! SQLite-backed replica set assignments for standalone deployments.

use std::path::Path;

use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use super::{ReplicaSet, ReplicaSetRegistry, UserAssignment};
use crate::error::{Error, Result};

/// Registry of record kept next to the ledger
pub struct LocalRegistry {
    conn: Mutex<Connection>,
}

impl LocalRegistry {
    /// Create or open the registry database
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let conn = Connection::open(data_dir.join("registry.db"))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS replica_sets (
                user_key TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                primary_endpoint TEXT NOT NULL,
                secondary1 TEXT NOT NULL,
                secondary2 TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_replica_sets_primary ON replica_sets(primary_endpoint);
            CREATE INDEX IF NOT EXISTS idx_replica_sets_secondary1 ON replica_sets(secondary1);
            CREATE INDEX IF NOT EXISTS idx_replica_sets_secondary2 ON replica_sets(secondary2);
            "#,
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create or replace a user's assignment
    pub async fn register(&self, user_key: &str, user_id: u64, replica_set: &ReplicaSet) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO replica_sets (user_key, user_id, primary_endpoint, secondary1, secondary2)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_key) DO UPDATE SET
                user_id = ?2, primary_endpoint = ?3, secondary1 = ?4, secondary2 = ?5,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                user_key,
                user_id as i64,
                replica_set.primary,
                replica_set.secondary1,
                replica_set.secondary2
            ],
        )?;
        Ok(())
    }
}

fn assignment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserAssignment> {
    Ok(UserAssignment {
        user_key: row.get(0)?,
        user_id: row.get::<_, i64>(1)? as u64,
        replica_set: ReplicaSet {
            primary: row.get(2)?,
            secondary1: row.get(3)?,
            secondary2: row.get(4)?,
        },
    })
}

#[async_trait::async_trait]
impl ReplicaSetRegistry for LocalRegistry {
    async fn get_replica_set(&self, user_key: &str) -> Result<Option<UserAssignment>> {
        let conn = self.conn.lock().await;
        let result = conn.query_row(
            "SELECT user_key, user_id, primary_endpoint, secondary1, secondary2 \
             FROM replica_sets WHERE user_key = ?1",
            params![user_key],
            assignment_from_row,
        );

        match result {
            Ok(assignment) => Ok(Some(assignment)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Registry(format!("Failed to read replica set for {}: {}", user_key, e))),
        }
    }

    async fn set_replica_set(&self, user_key: &str, primary: &str, secondary1: &str, secondary2: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE replica_sets SET primary_endpoint = ?2, secondary1 = ?3, secondary2 = ?4, \
             updated_at = CURRENT_TIMESTAMP WHERE user_key = ?1",
            params![user_key, primary, secondary1, secondary2],
        )?;

        if updated == 0 {
            return Err(Error::Registry(format!("No replica set registered for {}", user_key)));
        }

        tracing::info!(user = user_key, primary, secondary1, secondary2, "Replica set updated");
        Ok(())
    }

    async fn users_for_node(&self, endpoint: &str) -> Result<Vec<UserAssignment>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT user_key, user_id, primary_endpoint, secondary1, secondary2 FROM replica_sets \
             WHERE primary_endpoint = ?1 OR secondary1 = ?1 OR secondary2 = ?1 ORDER BY user_id",
        )?;
        let users = stmt
            .query_map(params![endpoint], assignment_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    async fn register(&self, user_key: &str, user_id: u64, replica_set: &ReplicaSet) -> Result<()> {
        LocalRegistry::register(self, user_key, user_id, replica_set).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_register_and_update() {
        let dir = tempdir().unwrap();
        let registry = LocalRegistry::open(dir.path()).unwrap();

        let set = ReplicaSet::new("http://cn1", "http://cn2", "http://cn3");
        registry.register("0xabc", 7, &set).await.unwrap();

        let assignment = registry.get_replica_set("0xabc").await.unwrap().unwrap();
        assert_eq!(assignment.user_id, 7);
        assert_eq!(assignment.replica_set, set);

        registry
            .set_replica_set("0xabc", "http://cn1", "http://cn4", "http://cn3")
            .await
            .unwrap();
        let assignment = registry.get_replica_set("0xabc").await.unwrap().unwrap();
        assert_eq!(assignment.replica_set.secondary1, "http://cn4");

        assert!(registry.get_replica_set("0xnobody").await.unwrap().is_none());
        assert!(registry
            .set_replica_set("0xnobody", "http://cn1", "http://cn2", "http://cn3")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_users_for_node() {
        let dir = tempdir().unwrap();
        let registry = LocalRegistry::open(dir.path()).unwrap();

        registry
            .register("0xa", 1, &ReplicaSet::new("http://cn1", "http://cn2", "http://cn3"))
            .await
            .unwrap();
        registry
            .register("0xb", 2, &ReplicaSet::new("http://cn2", "http://cn3", "http://cn4"))
            .await
            .unwrap();

        let cn1: Vec<_> = registry
            .users_for_node("http://cn1")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.user_key)
            .collect();
        assert_eq!(cn1, vec!["0xa"]);
        assert_eq!(registry.users_for_node("http://cn3").await.unwrap().len(), 2);
    }
}
