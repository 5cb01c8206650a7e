use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// The administrator identity as reported by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AuthUser {
    pub id: Uuid,
    #[ts(optional)]
    pub email: Option<String>,
}
