//! Administrative audit trail (entity creation and metadata edits).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use inventrack_core::{Actor, AuditId, DomainError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Insert => "INSERT",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
        }
    }
}

impl core::str::FromStr for AuditAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(AuditAction::Insert),
            "UPDATE" => Ok(AuditAction::Update),
            "DELETE" => Ok(AuditAction::Delete),
            other => Err(DomainError::validation(format!("unknown audit action '{other}'"))),
        }
    }
}

impl core::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit row before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub entity: String,
    pub entity_id: Option<String>,
    pub action: AuditAction,
    pub actor: Actor,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub extra: Option<JsonValue>,
    pub occurred_at: DateTime<Utc>,
}

impl NewAuditEntry {
    pub fn insert(
        entity: &str,
        entity_id: impl ToString,
        after: JsonValue,
        actor: &Actor,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity: entity.to_string(),
            entity_id: Some(entity_id.to_string()),
            action: AuditAction::Insert,
            actor: actor.clone(),
            before: None,
            after: Some(after),
            extra: None,
            occurred_at,
        }
    }

    pub fn update(
        entity: &str,
        entity_id: impl ToString,
        before: JsonValue,
        after: JsonValue,
        actor: &Actor,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity: entity.to_string(),
            entity_id: Some(entity_id.to_string()),
            action: AuditAction::Update,
            actor: actor.clone(),
            before: Some(before),
            after: Some(after),
            extra: None,
            occurred_at,
        }
    }

    pub fn with_extra(mut self, extra: JsonValue) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn into_entry(self, id: AuditId) -> AuditEntry {
        AuditEntry {
            id,
            entity: self.entity,
            entity_id: self.entity_id,
            action: self.action,
            actor: self.actor,
            before: self.before,
            after: self.after,
            extra: self.extra,
            occurred_at: self.occurred_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub entity: String,
    pub entity_id: Option<String>,
    pub action: AuditAction,
    pub actor: Actor,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub extra: Option<JsonValue>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_keeps_both_snapshots() {
        let actor = Actor::new("ana").unwrap();
        let entry = NewAuditEntry::update("equipment", 3, json!({"name": "a"}), json!({"name": "b"}), &actor, Utc::now())
            .into_entry(AuditId::new(1));

        assert_eq!(entry.action, AuditAction::Update);
        assert_eq!(entry.entity_id.as_deref(), Some("3"));
        assert_eq!(entry.before, Some(json!({"name": "a"})));
        assert_eq!(entry.after, Some(json!({"name": "b"})));
    }

    #[test]
    fn action_parses_case_insensitively() {
        assert_eq!("insert".parse::<AuditAction>().unwrap(), AuditAction::Insert);
        assert!("upsert".parse::<AuditAction>().is_err());
    }
}
