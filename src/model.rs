//! Core data model.
//!
//! An email is the unit of work in the outbox. It has no identity until the
//! store persists it and assigns a surrogate key; duplicates are allowed.

use serde::{Deserialize, Serialize};

/// Surrogate key assigned by the store on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmailId(pub i64);

impl std::fmt::Display for EmailId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pending email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    /// `None` until persisted.
    pub id: Option<EmailId>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl Email {
    /// An email that has not been persisted yet.
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}
