pub mod auth;
pub mod backend;
pub mod blog;
pub mod categories;
pub mod comments;
pub mod config;
pub mod error;
pub mod feed_cache;
pub mod newsletter;
pub mod posts;
pub mod retry;
pub mod setup_check;
