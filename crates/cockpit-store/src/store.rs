//! Async notification store.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use cockpit_core::{NotificationId, UserId};
use rusqlite::Connection;
use tracing::{debug, instrument};

use crate::errors::{Result, StoreError};
use crate::sqlite::{ConnectionConfig, ConnectionPool, NotificationRepo, new_file, new_in_memory, run_migrations};
use crate::types::{NewNotification, NotificationPage, NotificationQuery, NotificationRecord};

/// Durable notification storage.
///
/// Every read-side method is scoped to a user; mutating another user's
/// record fails with [`StoreError::PermissionDenied`].
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new unread notification.
    async fn create(&self, new: NewNotification) -> Result<NotificationRecord>;

    /// Fetch one record regardless of owner.
    async fn get(&self, id: &NotificationId) -> Result<Option<NotificationRecord>>;

    /// One page of the user's notifications, newest first.
    async fn list(&self, user_id: &UserId, query: NotificationQuery) -> Result<NotificationPage>;

    /// Mark one record read.
    async fn mark_read(&self, user_id: &UserId, id: &NotificationId) -> Result<NotificationRecord>;

    /// Mark all of the user's records read. Returns how many changed.
    async fn mark_all_read(&self, user_id: &UserId) -> Result<usize>;

    /// Unread records for the user.
    async fn unread_count(&self, user_id: &UserId) -> Result<u64>;

    /// Delete one record.
    async fn delete(&self, user_id: &UserId, id: &NotificationId) -> Result<()>;
}

/// [`NotificationStore`] on a pooled `SQLite` database.
///
/// Queries run on tokio's blocking pool so they never stall the reactor.
#[derive(Clone)]
pub struct SqliteNotificationStore {
    pool: ConnectionPool,
}

impl SqliteNotificationStore {
    /// Open (or create) a file-backed store and run migrations.
    pub fn open(path: &Path, pool_size: u32) -> Result<Self> {
        let config = ConnectionConfig {
            pool_size,
            ..ConnectionConfig::default()
        };
        Self::from_pool(new_file(path, &config)?)
    }

    /// A fresh in-memory store.
    pub fn in_memory() -> Result<Self> {
        Self::from_pool(new_in_memory(&ConnectionConfig::default())?)
    }

    fn from_pool(pool: ConnectionPool) -> Result<Self> {
        let applied = {
            let conn = pool.get()?;
            run_migrations(&conn)?
        };
        debug!(applied, "notification store ready");
        Ok(Self { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("blocking store task failed: {e}")))?
    }
}

#[async_trait]
impl NotificationStore for SqliteNotificationStore {
    #[instrument(skip_all, fields(user_id = %new.user_id, category = %new.category))]
    async fn create(&self, new: NewNotification) -> Result<NotificationRecord> {
        let record = NotificationRecord::from_new(new, Utc::now());
        self.with_conn(move |conn| {
            NotificationRepo::insert(conn, &record)?;
            Ok(record)
        })
        .await
    }

    async fn get(&self, id: &NotificationId) -> Result<Option<NotificationRecord>> {
        let id = id.clone();
        self.with_conn(move |conn| NotificationRepo::get(conn, &id)).await
    }

    async fn list(&self, user_id: &UserId, query: NotificationQuery) -> Result<NotificationPage> {
        let user_id = user_id.clone();
        self.with_conn(move |conn| NotificationRepo::list(conn, &user_id, &query))
            .await
    }

    #[instrument(skip_all, fields(user_id = %user_id, notification_id = %id))]
    async fn mark_read(&self, user_id: &UserId, id: &NotificationId) -> Result<NotificationRecord> {
        let (user_id, id) = (user_id.clone(), id.clone());
        self.with_conn(move |conn| NotificationRepo::mark_read(conn, &user_id, &id, Utc::now()))
            .await
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn mark_all_read(&self, user_id: &UserId) -> Result<usize> {
        let user_id = user_id.clone();
        self.with_conn(move |conn| NotificationRepo::mark_all_read(conn, &user_id, Utc::now()))
            .await
    }

    async fn unread_count(&self, user_id: &UserId) -> Result<u64> {
        let user_id = user_id.clone();
        self.with_conn(move |conn| NotificationRepo::unread_count(conn, &user_id))
            .await
    }

    #[instrument(skip_all, fields(user_id = %user_id, notification_id = %id))]
    async fn delete(&self, user_id: &UserId, id: &NotificationId) -> Result<()> {
        let (user_id, id) = (user_id.clone(), id.clone());
        self.with_conn(move |conn| NotificationRepo::delete(conn, &user_id, &id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn new_for(user: &str) -> NewNotification {
        NewNotification::new(UserId::from_raw(user), "task_created", "New task", "Review PR")
    }

    #[tokio::test]
    async fn create_generates_id_and_counts_unread() {
        let store = SqliteNotificationStore::in_memory().unwrap();
        let user = UserId::from_raw("u1");
        assert_eq!(store.unread_count(&user).await.unwrap(), 0);

        let rec = store.create(new_for("u1")).await.unwrap();
        assert!(rec.id.as_str().starts_with("ntf_"));
        assert_eq!(store.unread_count(&user).await.unwrap(), 1);

        let page = store.list(&user, NotificationQuery::unread()).await.unwrap();
        assert_eq!(page.notifications.len(), 1);
        assert_eq!(page.notifications[0].id, rec.id);
    }

    #[tokio::test]
    async fn read_transitions() {
        let store = SqliteNotificationStore::in_memory().unwrap();
        let user = UserId::from_raw("u1");
        let a = store.create(new_for("u1")).await.unwrap();
        let _ = store.create(new_for("u1")).await.unwrap();
        let _ = store.create(new_for("u1")).await.unwrap();

        let read = store.mark_read(&user, &a.id).await.unwrap();
        assert!(read.is_read);
        assert_eq!(store.unread_count(&user).await.unwrap(), 2);
        assert_eq!(store.mark_all_read(&user).await.unwrap(), 2);
        assert_eq!(store.unread_count(&user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn other_users_cannot_touch_records() {
        let store = SqliteNotificationStore::in_memory().unwrap();
        let rec = store.create(new_for("u1")).await.unwrap();
        let intruder = UserId::from_raw("u2");

        assert_matches!(
            store.mark_read(&intruder, &rec.id).await,
            Err(StoreError::PermissionDenied { .. })
        );
        assert_matches!(
            store.delete(&intruder, &rec.id).await,
            Err(StoreError::PermissionDenied { .. })
        );
        assert!(store.get(&rec.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = SqliteNotificationStore::in_memory().unwrap();
        let user = UserId::from_raw("u1");
        let rec = store.create(new_for("u1")).await.unwrap();
        store.delete(&user, &rec.id).await.unwrap();
        assert!(store.get(&rec.id).await.unwrap().is_none());
        assert_matches!(store.delete(&user, &rec.id).await, Err(StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cockpit.db");
        let id = {
            let store = SqliteNotificationStore::open(&path, 4).unwrap();
            store.create(new_for("u1")).await.unwrap().id
        };

        let store = SqliteNotificationStore::open(&path, 4).unwrap();
        let rec = store.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.title, "New task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_all_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteNotificationStore::open(&dir.path().join("c.db"), 4).unwrap());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.create(new_for("u1")).await }));
        }
        for h in handles {
            let _ = h.await.unwrap().unwrap();
        }
        assert_eq!(store.unread_count(&UserId::from_raw("u1")).await.unwrap(), 20);
    }
}
