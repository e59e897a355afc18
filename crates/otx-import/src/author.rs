//! Organization identity credited as the creator of every imported object.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::bundle::stix_id;

/// Built once at startup and shared by reference; never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorIdentity {
    id: String,
    name: String,
    description: String,
    created: DateTime<Utc>,
}

impl AuthorIdentity {
    /// The id depends only on `name`, so it is stable across restarts.
    pub fn organization(
        name: impl Into<String>,
        description: impl Into<String>,
        created: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        Self {
            id: stix_id("identity", &format!("organization|{}", name.to_lowercase())),
            name,
            description: description.into(),
            created,
        }
    }

    pub fn alienvault(created: DateTime<Utc>) -> Self {
        Self::organization(
            "AlienVault",
            "AlienVault is a developer of open source threat intelligence (OTX).",
            created,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn to_stix(&self) -> Value {
        let ts = self.created.to_rfc3339_opts(SecondsFormat::Millis, true);
        json!({
            "type": "identity",
            "spec_version": "2.1",
            "id": self.id,
            "created": ts,
            "modified": ts,
            "name": self.name,
            "description": self.description,
            "identity_class": "organization",
        })
    }
}
