//! Notification records and queries.

use chrono::{DateTime, Utc};
use cockpit_core::{NotificationId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to the business entity a notification is about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    /// Kind of entity, e.g. `task` or `calendar_event`.
    pub entity_type: String,
    /// Identifier within that kind.
    pub entity_id: String,
}

/// Input to `notify`: everything except the generated fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    /// Recipient.
    pub user_id: UserId,
    /// Category label, e.g. `task_created`.
    pub category: String,
    /// Short headline.
    pub title: String,
    /// Body text.
    pub content: String,
    /// Optional client action (deep link, button).
    #[serde(default)]
    pub action: Option<Value>,
    /// Optional related entity.
    #[serde(default)]
    pub related: Option<EntityRef>,
}

impl NewNotification {
    /// Minimal notification with no action or related entity.
    pub fn new(
        user_id: UserId,
        category: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            category: category.into(),
            title: title.into(),
            content: content.into(),
            action: None,
            related: None,
        }
    }

    /// Attach a related entity.
    #[must_use]
    pub fn with_related(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.related = Some(EntityRef {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        });
        self
    }

    /// Attach a client action.
    #[must_use]
    pub fn with_action(mut self, action: Value) -> Self {
        self.action = Some(action);
        self
    }
}

/// A persisted notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Generated identifier.
    pub id: NotificationId,
    /// Recipient.
    pub user_id: UserId,
    /// Category label.
    pub category: String,
    /// Short headline.
    pub title: String,
    /// Body text.
    pub content: String,
    /// Optional client action.
    pub action: Option<Value>,
    /// Optional related entity.
    pub related: Option<EntityRef>,
    /// Read flag.
    pub is_read: bool,
    /// When the record was first marked read.
    pub read_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Build an unread record from its input, stamping id and timestamps.
    pub fn from_new(new: NewNotification, now: DateTime<Utc>) -> Self {
        Self {
            id: NotificationId::new(),
            user_id: new.user_id,
            category: new.category,
            title: new.title,
            content: new.content,
            action: new.action,
            related: new.related,
            is_read: false,
            read_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Paging and filters for listing a user's notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationQuery {
    /// 1-based page number.
    pub page: u32,
    /// Records per page, clamped to `1..=MAX_PAGE_SIZE`.
    pub page_size: u32,
    /// Only unread records.
    pub unread_only: bool,
    /// Only this category.
    pub category: Option<String>,
}

impl NotificationQuery {
    /// Largest accepted page size.
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Unread records, first page.
    pub fn unread() -> Self {
        Self {
            unread_only: true,
            ..Self::default()
        }
    }

    pub(crate) fn normalized(&self) -> (u32, u32) {
        (self.page.max(1), self.page_size.clamp(1, Self::MAX_PAGE_SIZE))
    }
}

impl Default for NotificationQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
            unread_only: false,
            category: None,
        }
    }
}

/// One page of notifications, newest first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationPage {
    /// Records on this page.
    pub notifications: Vec<NotificationRecord>,
    /// Records matching the filters across all pages.
    pub total_count: u64,
    /// The user's unread records regardless of filters.
    pub unread_count: u64,
    /// Page number served.
    pub page: u32,
    /// Page size served.
    pub page_size: u32,
    /// Whether a further page exists.
    pub has_next: bool,
}
