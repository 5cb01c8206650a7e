use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::some_if_present;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    /// Hex display color, e.g. `#6366f1`.
    pub color: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct CreateCategoryRequest {
    pub name: String,
    pub slug: String,
    #[ts(optional)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct UpdateCategoryRequest {
    #[serde(default, deserialize_with = "some_if_present", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "some_if_present", skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, deserialize_with = "some_if_present", skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl UpdateCategoryRequest {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.slug.is_none() && self.color.is_none()
    }
}
