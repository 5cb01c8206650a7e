use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::null_as_default;

/// Focal point and zoom used when cropping the cover photo.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CoverImagePosition {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl CoverImagePosition {
    pub const MIN_ZOOM: f64 = 50.0;
    pub const MAX_ZOOM: f64 = 200.0;

    /// Returns a copy with every component pulled back into its valid range.
    pub fn clamped(self) -> Self {
        Self {
            x: clamp_or(self.x, 0.0, 100.0, 50.0),
            y: clamp_or(self.y, 0.0, 100.0, 50.0),
            zoom: clamp_or(self.zoom, Self::MIN_ZOOM, Self::MAX_ZOOM, 100.0),
        }
    }
}

impl Default for CoverImagePosition {
    fn default() -> Self {
        Self {
            x: 50.0,
            y: 50.0,
            zoom: 100.0,
        }
    }
}

fn clamp_or(value: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(min, max)
    }
}

/// A published post as stored in the `posts` table.
///
/// When `cover_image_url` is set it is always `photo_urls[0]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct BlogPost {
    pub id: Uuid,
    pub title: String,
    /// HTML produced by the rich-text editor.
    pub story: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub photo_urls: Vec<String>,
    pub cover_image_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cover_image_position: CoverImagePosition,
    #[serde(default, deserialize_with = "null_as_default")]
    pub category_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlogPost {
    pub fn in_category(&self, category_id: Uuid) -> bool {
        self.category_ids.contains(&category_id)
    }
}

/// One page of the feed.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PostPage {
    pub posts: Vec<BlogPost>,
    pub has_more: bool,
    #[ts(type = "number")]
    pub total: u64,
}
