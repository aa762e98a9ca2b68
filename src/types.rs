// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core data model for the credentials vault (spec §3).

use crate::crypto::Envelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Classification of a stored credential.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    ApiKey,
    OauthToken,
    BasicAuth,
    DbConnection,
    SshKey,
    Custom,
}

impl CredentialType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::OauthToken => "oauth_token",
            Self::BasicAuth => "basic_auth",
            Self::DbConnection => "db_connection",
            Self::SshKey => "ssh_key",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api_key" => Some(Self::ApiKey),
            "oauth_token" => Some(Self::OauthToken),
            "basic_auth" => Some(Self::BasicAuth),
            "db_connection" => Some(Self::DbConnection),
            "ssh_key" => Some(Self::SshKey),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Lifecycle status of a credential row. `Rotated` is reserved for future
/// multi-version schemes and is currently unused by `rotate`, which keeps
/// `Active` (spec §4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Rotated,
    Revoked,
}

impl CredentialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rotated => "rotated",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "rotated" => Some(Self::Rotated),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// Kind of entity a policy or audit entry refers to.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    #[default]
    Skill,
    Tool,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skill => "skill",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "skill" => Some(Self::Skill),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Access-level hierarchy: `Admin > Write > Read`, per spec §4.5.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// True iff `self` satisfies a requirement of `required`, under the
    /// `admin > write > read` hierarchy.
    pub fn satisfies(self, required: AccessLevel) -> bool {
        self >= required
    }
}

/// Audit event kind.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    #[default]
    Retrieve,
    Rotate,
    Revoke,
    GrantAccess,
    RevokeAccess,
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retrieve => "retrieve",
            Self::Rotate => "rotate",
            Self::Revoke => "revoke",
            Self::GrantAccess => "grant_access",
            Self::RevokeAccess => "revoke_access",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retrieve" => Some(Self::Retrieve),
            "rotate" => Some(Self::Rotate),
            "revoke" => Some(Self::Revoke),
            "grant_access" => Some(Self::GrantAccess),
            "revoke_access" => Some(Self::RevokeAccess),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// The typed plaintext of a credential. A closed sum type per spec §9 — all
/// six variants are exhaustively matched; only `Custom` is an open map, kept
/// that way deliberately for extensibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialValue {
    ApiKey {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    OauthToken {
        access: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        refresh: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        scopes: Option<Vec<String>>,
    },
    BasicAuth {
        user: String,
        password: String,
    },
    DbConnection {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ssl: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<Map<String, Value>>,
    },
    SshKey {
        private_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    Custom(Map<String, Value>),
}

impl CredentialValue {
    /// The [`CredentialType`] this value variant belongs to.
    pub fn credential_type(&self) -> CredentialType {
        match self {
            Self::ApiKey { .. } => CredentialType::ApiKey,
            Self::OauthToken { .. } => CredentialType::OauthToken,
            Self::BasicAuth { .. } => CredentialType::BasicAuth,
            Self::DbConnection { .. } => CredentialType::DbConnection,
            Self::SshKey { .. } => CredentialType::SshKey,
            Self::Custom(_) => CredentialType::Custom,
        }
    }

    /// Encode as the UTF-8 JSON the cipher expects as plaintext (spec §3:
    /// "plaintext is a UTF-8 JSON encoding of the typed credential value").
    pub fn to_json_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Decode from the cipher's plaintext JSON value.
    pub fn from_json_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// A stored credential's metadata (never the decrypted value).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialMetadata {
    pub id: String,
    pub name: String,
    pub environment: String,
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    pub service: String,
    pub encryption_key_id: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub status: CredentialStatus,
}

/// A decrypted credential returned from [`crate::store::Store::retrieve`]:
/// the plaintext value plus its metadata. The plaintext lives only on the
/// return path — callers own its lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedCredential {
    pub metadata: CredentialMetadata,
    pub value: CredentialValue,
}

/// A credential row as stored, with its still-encrypted envelope. Internal
/// to `store` — never returned across the public `retrieve`/`list` surface.
#[derive(Debug, Clone)]
pub(crate) struct CredentialRow {
    pub metadata: CredentialMetadata,
    pub envelope: Envelope,
}

/// An access-policy grant tying one credential to one consuming entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessPolicy {
    pub id: String,
    pub credential_id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub access_level: AccessLevel,
    pub granted_by: Option<String>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// An append-only audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: String,
    pub credential_id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub user_id: Option<String>,
    pub action: AuditAction,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

/// A Master-Key record: identification only, never the key material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasterKeyRecord {
    pub id: String,
    pub key_hash: String,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub rotated_to: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_level_hierarchy_is_admin_over_write_over_read() {
        assert!(AccessLevel::Admin.satisfies(AccessLevel::Read));
        assert!(AccessLevel::Admin.satisfies(AccessLevel::Write));
        assert!(AccessLevel::Admin.satisfies(AccessLevel::Admin));
        assert!(AccessLevel::Write.satisfies(AccessLevel::Read));
        assert!(!AccessLevel::Write.satisfies(AccessLevel::Admin));
        assert!(!AccessLevel::Read.satisfies(AccessLevel::Write));
    }

    #[test]
    fn credential_value_round_trips_through_json() {
        let value = CredentialValue::DbConnection {
            host: "db.internal".into(),
            port: 5432,
            database: "app".into(),
            user: "app_user".into(),
            password: "hunter2".into(),
            ssl: Some(true),
            options: None,
        };
        let json = value.to_json_value().unwrap();
        let round_tripped = CredentialValue::from_json_value(json).unwrap();
        assert_eq!(value, round_tripped);
        assert_eq!(value.credential_type(), CredentialType::DbConnection);
    }

    #[test]
    fn custom_variant_keeps_an_open_map() {
        let mut map = Map::new();
        map.insert("anything".to_string(), Value::String("goes".to_string()));
        let value = CredentialValue::Custom(map);
        assert_eq!(value.credential_type(), CredentialType::Custom);
    }

    #[test]
    fn type_enum_string_round_trips() {
        for t in [
            CredentialType::ApiKey,
            CredentialType::OauthToken,
            CredentialType::BasicAuth,
            CredentialType::DbConnection,
            CredentialType::SshKey,
            CredentialType::Custom,
        ] {
            assert_eq!(CredentialType::parse(t.as_str()), Some(t));
        }
    }
}
