// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! C5 — Access Controller.
//!
//! Owns the `policies` table. `has_access` is a pure predicate with no side
//! effects; the mutating entry points (`grant_access`, `revoke_access`,
//! `update_access_level`) each write exactly one audit row themselves,
//! since C5 sits above C6 in the dependency order (spec §4.5).

use crate::audit::{self, LogEntry};
use crate::error::{AccessDenialReason, Error, Result};
use crate::ids;
use crate::types::{AccessLevel, AccessPolicy, AuditAction, CredentialMetadata, CredentialStatus, CredentialType, EntityType};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

/// Grant (or replace) one entity's access level on one credential. Upserts
/// on the `(credential_id, entity_id, entity_type)` unique key.
pub fn grant_access(
    conn: &Connection,
    credential_id: &str,
    entity_id: &str,
    entity_type: EntityType,
    access_level: AccessLevel,
    granted_by: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
    reason: Option<&str>,
) -> Result<String> {
    if credential_row_exists(conn, credential_id)?.is_none() {
        return Err(Error::CredentialNotFound(credential_id.to_string()));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM policies WHERE credential_id = ?1 AND entity_id = ?2 AND entity_type = ?3",
            params![credential_id, entity_id, entity_type.as_str()],
            |r| r.get(0),
        )
        .optional()?;

    let now = Utc::now();
    let id = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE policies SET access_level = ?1, granted_by = ?2, granted_at = ?3, expires_at = ?4, reason = ?5 WHERE id = ?6",
                params![
                    access_level.as_str(),
                    granted_by,
                    now.to_rfc3339(),
                    expires_at.map(|t| t.to_rfc3339()),
                    reason,
                    id,
                ],
            )?;
            id
        }
        None => {
            let id = ids::new_policy_id();
            conn.execute(
                "INSERT INTO policies (id, credential_id, entity_id, entity_type, access_level, granted_by, granted_at, expires_at, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    credential_id,
                    entity_id,
                    entity_type.as_str(),
                    access_level.as_str(),
                    granted_by,
                    now.to_rfc3339(),
                    expires_at.map(|t| t.to_rfc3339()),
                    reason,
                ],
            )?;
            id
        }
    };

    audit::log(
        conn,
        LogEntry {
            credential_id,
            entity_id,
            entity_type,
            user_id: granted_by,
            action: AuditAction::GrantAccess,
            success: true,
            ip_address: None,
            error_message: None,
            metadata: None,
        },
    )?;

    Ok(id)
}

/// Revoke one entity's access to one credential. Returns `true` if a policy
/// row existed and was removed.
pub fn revoke_access(
    conn: &Connection,
    credential_id: &str,
    entity_id: &str,
    entity_type: EntityType,
    revoked_by: Option<&str>,
) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM policies WHERE credential_id = ?1 AND entity_id = ?2 AND entity_type = ?3",
        params![credential_id, entity_id, entity_type.as_str()],
    )?;

    audit::log(
        conn,
        LogEntry {
            credential_id,
            entity_id,
            entity_type,
            user_id: revoked_by,
            action: AuditAction::RevokeAccess,
            success: true,
            ip_address: None,
            error_message: None,
            metadata: None,
        },
    )?;

    Ok(removed > 0)
}

/// Delete every policy granted on a credential, e.g. ahead of a hard
/// delete. Returns the number of policies removed.
pub fn revoke_all_access(conn: &Connection, credential_id: &str) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM policies WHERE credential_id = ?1",
        params![credential_id],
    )?;
    Ok(removed)
}

/// Pure predicate: does `entity_id`/`entity_type` hold at least
/// `required` access on `credential_id`? No audit side effect.
pub fn has_access(
    conn: &Connection,
    credential_id: &str,
    entity_id: &str,
    entity_type: EntityType,
    required: AccessLevel,
) -> Result<bool> {
    match check(conn, credential_id, entity_id, entity_type, required) {
        Ok(Ok(())) => Ok(true),
        Ok(Err(_)) => Ok(false),
        // A pure predicate never errors on an unknown/already-deleted
        // credential id — it simply has nothing to grant access to.
        Err(Error::CredentialNotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Like [`has_access`] but returns the denial reason instead of collapsing
/// to a bool; used internally by [`assert_access`].
fn check(
    conn: &Connection,
    credential_id: &str,
    entity_id: &str,
    entity_type: EntityType,
    required: AccessLevel,
) -> Result<std::result::Result<(), AccessDenialReason>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM credentials WHERE id = ?1",
            params![credential_id],
            |r| r.get(0),
        )
        .optional()?;

    let status = match status {
        Some(s) => s,
        None => return Err(Error::CredentialNotFound(credential_id.to_string())),
    };

    if CredentialStatus::parse(&status) != Some(CredentialStatus::Active) {
        return Ok(Err(AccessDenialReason::CredentialNotActive));
    }

    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT access_level, expires_at FROM policies WHERE credential_id = ?1 AND entity_id = ?2 AND entity_type = ?3",
            params![credential_id, entity_id, entity_type.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let (level_str, expires_at) = match row {
        Some(v) => v,
        None => return Ok(Err(AccessDenialReason::NoPolicy)),
    };

    if let Some(expires_at) = expires_at {
        if let Ok(expires_at) = DateTime::parse_from_rfc3339(&expires_at) {
            if expires_at.with_timezone(&Utc) <= Utc::now() {
                return Ok(Err(AccessDenialReason::Expired));
            }
        }
    }

    let granted = AccessLevel::parse(&level_str).unwrap_or(AccessLevel::Read);
    if granted.satisfies(required) {
        Ok(Ok(()))
    } else {
        Ok(Err(AccessDenialReason::InsufficientLevel {
            granted: granted.as_str().to_string(),
            required: required.as_str().to_string(),
        }))
    }
}

/// Enforce `required` access, returning [`Error::AccessDenied`] on failure.
/// Does not write an audit row itself — callers (store's `retrieve`) log
/// the outcome once, alongside the rest of the operation's result.
pub fn assert_access(
    conn: &Connection,
    credential_id: &str,
    entity_id: &str,
    entity_type: EntityType,
    required: AccessLevel,
) -> Result<()> {
    match check(conn, credential_id, entity_id, entity_type, required)? {
        Ok(()) => Ok(()),
        Err(reason) => Err(Error::AccessDenied {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.as_str().to_string(),
            reason,
        }),
    }
}

/// All policies granted on a credential.
pub fn get_access_policies(conn: &Connection, credential_id: &str) -> Result<Vec<AccessPolicy>> {
    let mut stmt = conn.prepare(
        "SELECT id, credential_id, entity_id, entity_type, access_level, granted_by, granted_at, expires_at, reason
         FROM policies WHERE credential_id = ?1",
    )?;
    let rows = stmt.query_map(params![credential_id], row_to_policy)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// All active credentials an entity currently holds at least read access
/// to (joins against `credentials` and filters to `status = 'active'`).
pub fn get_accessible_credentials(
    conn: &Connection,
    entity_id: &str,
    entity_type: EntityType,
) -> Result<Vec<CredentialMetadata>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.environment, c.type, c.service, c.encryption_key_id, c.metadata, c.created_at, c.updated_at, c.last_rotated_at, c.status
         FROM credentials c
         JOIN policies p ON p.credential_id = c.id
         WHERE p.entity_id = ?1 AND p.entity_type = ?2 AND c.status = 'active'
           AND (p.expires_at IS NULL OR p.expires_at > datetime('now'))",
    )?;
    let rows = stmt.query_map(params![entity_id, entity_type.as_str()], row_to_metadata)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Replace the access level of an existing policy. Returns `false` if no
/// policy exists for the given `(credential_id, entity_id, entity_type)`.
pub fn update_access_level(
    conn: &Connection,
    credential_id: &str,
    entity_id: &str,
    entity_type: EntityType,
    new_level: AccessLevel,
    updated_by: Option<&str>,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE policies SET access_level = ?1 WHERE credential_id = ?2 AND entity_id = ?3 AND entity_type = ?4",
        params![new_level.as_str(), credential_id, entity_id, entity_type.as_str()],
    )?;

    if updated > 0 {
        audit::log(
            conn,
            LogEntry {
                credential_id,
                entity_id,
                entity_type,
                user_id: updated_by,
                action: AuditAction::GrantAccess,
                success: true,
                ip_address: None,
                error_message: None,
                metadata: None,
            },
        )?;
    }

    Ok(updated > 0)
}

/// Delete every policy whose `expires_at` has passed. Returns the count
/// removed.
pub fn cleanup_expired_policies(conn: &Connection) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM policies WHERE expires_at IS NOT NULL AND expires_at <= datetime('now')",
        [],
    )?;
    Ok(removed)
}

/// Policies expiring within the next `days` days (not yet expired).
pub fn get_policies_expiring_soon(conn: &Connection, days: i64) -> Result<Vec<AccessPolicy>> {
    let cutoff = Utc::now() + chrono::Duration::days(days);
    let mut stmt = conn.prepare(
        "SELECT id, credential_id, entity_id, entity_type, access_level, granted_by, granted_at, expires_at, reason
         FROM policies
         WHERE expires_at IS NOT NULL AND expires_at > datetime('now') AND expires_at <= ?1",
    )?;
    let rows = stmt.query_map(params![cutoff.to_rfc3339()], row_to_policy)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn credential_row_exists(conn: &Connection, credential_id: &str) -> Result<Option<()>> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM credentials WHERE id = ?1",
            params![credential_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(exists.map(|_| ()))
}

fn row_to_policy(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessPolicy> {
    let entity_type_str: String = row.get(3)?;
    let access_level_str: String = row.get(4)?;
    let granted_at_str: String = row.get(6)?;
    let expires_at_str: Option<String> = row.get(7)?;

    Ok(AccessPolicy {
        id: row.get(0)?,
        credential_id: row.get(1)?,
        entity_id: row.get(2)?,
        entity_type: EntityType::parse(&entity_type_str).unwrap_or_default(),
        access_level: AccessLevel::parse(&access_level_str).unwrap_or(AccessLevel::Read),
        granted_by: row.get(5)?,
        granted_at: DateTime::parse_from_rfc3339(&granted_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        expires_at: expires_at_str.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
        reason: row.get(8)?,
    })
}

fn row_to_metadata(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialMetadata> {
    let type_str: String = row.get(3)?;
    let metadata_str: String = row.get(6)?;
    let created_at_str: String = row.get(7)?;
    let updated_at_str: String = row.get(8)?;
    let last_rotated_str: Option<String> = row.get(9)?;
    let status_str: String = row.get(10)?;

    Ok(CredentialMetadata {
        id: row.get(0)?,
        name: row.get(1)?,
        environment: row.get(2)?,
        credential_type: CredentialType::parse(&type_str).unwrap_or(CredentialType::Custom),
        service: row.get(4)?,
        encryption_key_id: row.get(5)?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        last_rotated_at: last_rotated_str.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
        status: CredentialStatus::parse(&status_str).unwrap_or(CredentialStatus::Active),
    })
}
