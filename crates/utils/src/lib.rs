pub mod email;
pub mod logging;
pub mod sentry;
pub mod text;
