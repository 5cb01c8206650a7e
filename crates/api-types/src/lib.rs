//! Types shared between the blog's data-access layer and its UI.
//!
//! This crate contains:
//! - Row types (e.g., `BlogPost`, `Category`) - the API representation of table rows
//! - Request types (e.g., `CreateCategoryRequest`, `UpdateCategoryRequest`) - API input types
//! - Small value types (e.g., `CoverImagePosition`, `PostPage`)

use serde::{Deserialize, Deserializer};

pub mod category;
pub mod comment;
pub mod newsletter;
pub mod post;
pub mod user;

pub use category::*;
pub use comment::*;
pub use newsletter::*;
pub use post::*;
pub use user::*;

pub fn some_if_present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Treats an explicit `null` column the same as a missing one.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}
