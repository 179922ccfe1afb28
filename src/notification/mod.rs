//! Scheduled notifications.
//!
//! A game schedules a notification with an optional id, an absolute
//! wall-clock instant, and a payload. When the instant passes the payload is
//! handed back to the game's `onNotify` handler. Pending notifications are
//! written to disk when the instance is paused and re-armed when it resumes.

mod scheduler;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub use scheduler::NotificationScheduler;

use crate::script::persistence;
use crate::script::ScriptValue;
use crate::Result;

/// A pending notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    /// Optional identity; scheduling the same id again replaces the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// When to deliver, in milliseconds since the Unix epoch.
    pub instant: i64,
    /// Payload as a persisted document.
    pub data: Json,
}

impl ScheduledNotification {
    /// Create a notification, copying `payload` through the persistence
    /// format so later changes to the original value are not seen.
    ///
    /// Parts of the payload that cannot be persisted are dropped.
    pub fn new(id: Option<String>, instant: i64, payload: &ScriptValue) -> Result<Self> {
        Ok(Self {
            id,
            instant,
            data: persistence::to_document(payload, true)?,
        })
    }

    /// Decode the payload.
    pub fn payload(&self) -> Result<ScriptValue> {
        persistence::from_document(&self.data)
    }
}
