//! Persist-then-deliver notifications.

mod dispatcher;

pub use dispatcher::{DeliveryReport, NotificationDispatcher, notification_payload};
