use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::user::UserId;

/// One row of `profiles`, keyed by the owning user's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of the caller-editable profile fields.
///
/// Id, email and timestamps are not editable through this type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ProfileChanges {
    pub fn first_name(mut self, value: impl Into<String>) -> Self {
        self.first_name = Some(value.into());
        self
    }

    pub fn last_name(mut self, value: impl Into<String>) -> Self {
        self.last_name = Some(value.into());
        self
    }

    pub fn avatar_url(mut self, value: impl Into<String>) -> Self {
        self.avatar_url = Some(value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changed_fields().is_empty()
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        [
            ("first name", self.first_name.is_some()),
            ("last name", self.last_name.is_some()),
            ("avatar", self.avatar_url.is_some()),
        ]
        .into_iter()
        .filter_map(|(label, changed)| changed.then_some(label))
        .collect()
    }

    /// Activity-log description for this change set.
    pub fn describe(&self) -> String {
        format!("Updated profile: {}", self.changed_fields().join(", "))
    }
}
