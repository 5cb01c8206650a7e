use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewsletterSubscriber {
    pub id: Uuid,
    pub email: String,
    pub is_active: bool,
    pub subscribed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeOutcome {
    Subscribed,
    /// The address was already on the list and has been re-activated.
    Resubscribed,
}

/// Result returned by the `send-newsletter` function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
pub struct NewsletterDispatch {
    #[serde(default)]
    pub sent: u32,
}
