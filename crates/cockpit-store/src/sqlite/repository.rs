//! Notification repository. Stateless; every method takes `&Connection`.

use chrono::{DateTime, SecondsFormat, Utc};
use cockpit_core::{NotificationId, UserId};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::errors::{Result, StoreError};
use crate::types::{EntityRef, NotificationPage, NotificationQuery, NotificationRecord};

const COLUMNS: &str = "id, user_id, category, title, content, action, related_entity_type, \
                       related_entity_id, is_read, read_at, created_at, updated_at";

/// Notification repository.
pub struct NotificationRepo;

impl NotificationRepo {
    /// Insert a fully formed record.
    pub fn insert(conn: &Connection, record: &NotificationRecord) -> Result<()> {
        let action = record.action.as_ref().map(serde_json::to_string).transpose()?;
        let (entity_type, entity_id) = match &record.related {
            Some(r) => (Some(r.entity_type.as_str()), Some(r.entity_id.as_str())),
            None => (None, None),
        };

        let _ = conn.execute(
            "INSERT INTO notifications (id, user_id, category, title, content, action,
             related_entity_type, related_entity_id, is_read, read_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id.as_str(),
                record.user_id.as_str(),
                record.category,
                record.title,
                record.content,
                action,
                entity_type,
                entity_id,
                record.is_read,
                record.read_at.map(format_ts),
                format_ts(record.created_at),
                format_ts(record.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Fetch one record by id.
    pub fn get(conn: &Connection, id: &NotificationId) -> Result<Option<NotificationRecord>> {
        let record = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM notifications WHERE id = ?1"),
                params![id.as_str()],
                map_row,
            )
            .optional()?;
        Ok(record)
    }

    /// One page of a user's notifications, newest first.
    pub fn list(
        conn: &Connection,
        user_id: &UserId,
        query: &NotificationQuery,
    ) -> Result<NotificationPage> {
        let (page, page_size) = query.normalized();
        let offset = i64::from(page - 1) * i64::from(page_size);
        let category = query.category.as_deref();

        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM notifications
             WHERE user_id = ?1
               AND (?2 = 0 OR is_read = 0)
               AND (?3 IS NULL OR category = ?3)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?4 OFFSET ?5"
        ))?;
        let notifications = stmt
            .query_map(
                params![
                    user_id.as_str(),
                    query.unread_only,
                    category,
                    i64::from(page_size),
                    offset
                ],
                map_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notifications
             WHERE user_id = ?1
               AND (?2 = 0 OR is_read = 0)
               AND (?3 IS NULL OR category = ?3)",
            params![user_id.as_str(), query.unread_only, category],
            |row| row.get(0),
        )?;
        let total_count = u64::try_from(total).unwrap_or(0);
        let seen = u64::try_from(offset).unwrap_or(0) + notifications.len() as u64;

        Ok(NotificationPage {
            has_next: seen < total_count,
            notifications,
            total_count,
            unread_count: Self::unread_count(conn, user_id)?,
            page,
            page_size,
        })
    }

    /// Mark one record read after checking ownership.
    ///
    /// Marking an already-read record is a no-op that returns it unchanged.
    pub fn mark_read(
        conn: &Connection,
        user_id: &UserId,
        id: &NotificationId,
        now: DateTime<Utc>,
    ) -> Result<NotificationRecord> {
        let mut record = Self::owned(conn, user_id, id)?;
        if record.is_read {
            return Ok(record);
        }

        let _ = conn.execute(
            "UPDATE notifications SET is_read = 1, read_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id.as_str(), format_ts(now)],
        )?;
        record.is_read = true;
        record.read_at = Some(now);
        record.updated_at = now;
        Ok(record)
    }

    /// Mark every unread record of the user read. Returns how many changed.
    pub fn mark_all_read(conn: &Connection, user_id: &UserId, now: DateTime<Utc>) -> Result<usize> {
        let changed = conn.execute(
            "UPDATE notifications SET is_read = 1, read_at = ?2, updated_at = ?2
             WHERE user_id = ?1 AND is_read = 0",
            params![user_id.as_str(), format_ts(now)],
        )?;
        Ok(changed)
    }

    /// Number of unread records for the user.
    pub fn unread_count(conn: &Connection, user_id: &UserId) -> Result<u64> {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND is_read = 0",
            params![user_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Delete one record after checking ownership.
    pub fn delete(conn: &Connection, user_id: &UserId, id: &NotificationId) -> Result<()> {
        let _ = Self::owned(conn, user_id, id)?;
        let _ = conn.execute(
            "DELETE FROM notifications WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn owned(conn: &Connection, user_id: &UserId, id: &NotificationId) -> Result<NotificationRecord> {
        let record =
            Self::get(conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if &record.user_id != user_id {
            return Err(StoreError::PermissionDenied {
                notification_id: id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(record)
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<NotificationRecord> {
    let action: Option<String> = row.get(5)?;
    let action = action
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    let entity_type: Option<String> = row.get(6)?;
    let entity_id: Option<String> = row.get(7)?;
    let related = match (entity_type, entity_id) {
        (Some(entity_type), Some(entity_id)) => Some(EntityRef {
            entity_type,
            entity_id,
        }),
        _ => None,
    };

    let read_at: Option<String> = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(NotificationRecord {
        id: NotificationId::from_raw(row.get::<_, String>(0)?),
        user_id: UserId::from_raw(row.get::<_, String>(1)?),
        category: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        action,
        related,
        is_read: row.get(8)?,
        read_at: read_at.map(|raw| parse_ts(9, &raw)).transpose()?,
        created_at: parse_ts(10, &created_at)?,
        updated_at: parse_ts(11, &updated_at)?,
    })
}
