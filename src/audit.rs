// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! C6 — Audit Logger.
//!
//! Append-only; no update path exists. [`log`] must never throw in a way
//! that masks the underlying operation's result — callers that invoke it
//! after already having the real outcome in hand should swallow a logging
//! failure and merely report it out of band (spec §4.6/§7).

use crate::error::Result;
use crate::ids;
use crate::types::{AuditAction, AuditEntry, EntityType};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Parameters for a single [`log`] call, grouped because every caller
/// threads the same `user_id`/`ip_address` pair through from its options.
#[derive(Debug, Clone, Default)]
pub struct LogEntry<'a> {
    pub credential_id: &'a str,
    pub entity_id: &'a str,
    pub entity_type: EntityType,
    pub user_id: Option<&'a str>,
    pub action: AuditAction,
    pub success: bool,
    pub ip_address: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub metadata: Option<Map<String, Value>>,
}

/// Write one append-only audit row. Synchronous insert, per spec §4.6.
pub fn log(conn: &Connection, entry: LogEntry<'_>) -> Result<String> {
    let id = ids::new_audit_id();
    let now = Utc::now();
    let metadata_json = entry
        .metadata
        .as_ref()
        .map(|m| serde_json::to_string(m))
        .transpose()?;

    conn.execute(
        "INSERT INTO audit_log (id, credential_id, entity_id, entity_type, user_id, action, success, timestamp, ip_address, error_message, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id,
            entry.credential_id,
            entry.entity_id,
            entry.entity_type.as_str(),
            entry.user_id,
            entry.action.as_str(),
            entry.success,
            now.to_rfc3339(),
            entry.ip_address,
            entry.error_message,
            metadata_json,
        ],
    )?;
    Ok(id)
}

/// Filters for [`query`]. All fields are optional narrowing predicates;
/// results are always `ORDER BY timestamp DESC`.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery<'a> {
    pub credential_id: Option<&'a str>,
    pub entity_id: Option<&'a str>,
    pub entity_type: Option<EntityType>,
    pub user_id: Option<&'a str>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub action: Option<AuditAction>,
    pub success_only: bool,
    pub limit: Option<i64>,
}

/// Default `limit` for an unbounded `recent` query, per spec §4.6.
pub const DEFAULT_QUERY_LIMIT: i64 = 100;

/// Parameterized audit query, always ordered by `timestamp DESC`.
pub fn query(conn: &Connection, filter: &AuditQuery<'_>) -> Result<Vec<AuditEntry>> {
    let mut sql = String::from(
        "SELECT id, credential_id, entity_id, entity_type, user_id, action, success, timestamp, ip_address, error_message, metadata FROM audit_log WHERE 1=1",
    );
    let mut clauses = Vec::new();
    if filter.credential_id.is_some() {
        clauses.push(" AND credential_id = ?");
    }
    if filter.entity_id.is_some() {
        clauses.push(" AND entity_id = ?");
    }
    if filter.entity_type.is_some() {
        clauses.push(" AND entity_type = ?");
    }
    if filter.user_id.is_some() {
        clauses.push(" AND user_id = ?");
    }
    if filter.since.is_some() {
        clauses.push(" AND timestamp >= ?");
    }
    if filter.until.is_some() {
        clauses.push(" AND timestamp <= ?");
    }
    if filter.action.is_some() {
        clauses.push(" AND action = ?");
    }
    if filter.success_only {
        clauses.push(" AND success = 1");
    }
    for clause in &clauses {
        sql.push_str(clause);
    }
    sql.push_str(" ORDER BY timestamp DESC LIMIT ?");

    let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT);

    let mut stmt = conn.prepare(&sql)?;
    let mut param_values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(v) = filter.credential_id {
        param_values.push(Box::new(v.to_string()));
    }
    if let Some(v) = filter.entity_id {
        param_values.push(Box::new(v.to_string()));
    }
    if let Some(v) = filter.entity_type {
        param_values.push(Box::new(v.as_str().to_string()));
    }
    if let Some(v) = filter.user_id {
        param_values.push(Box::new(v.to_string()));
    }
    if let Some(v) = filter.since {
        param_values.push(Box::new(v.to_rfc3339()));
    }
    if let Some(v) = filter.until {
        param_values.push(Box::new(v.to_rfc3339()));
    }
    if let Some(v) = filter.action {
        param_values.push(Box::new(v.as_str().to_string()));
    }
    param_values.push(Box::new(limit));

    let params_refs: Vec<&dyn rusqlite::ToSql> = param_values.iter().map(|b| b.as_ref()).collect();

    let rows = stmt.query_map(params_refs.as_slice(), row_to_audit_entry)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn row_to_audit_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let entity_type_str: String = row.get(3)?;
    let action_str: String = row.get(5)?;
    let timestamp_str: String = row.get(7)?;
    let metadata_str: Option<String> = row.get(10)?;

    Ok(AuditEntry {
        id: row.get(0)?,
        credential_id: row.get(1)?,
        entity_id: row.get(2)?,
        entity_type: EntityType::parse(&entity_type_str).unwrap_or(EntityType::Skill),
        user_id: row.get(4)?,
        action: AuditAction::parse(&action_str).unwrap_or(AuditAction::Retrieve),
        success: row.get(6)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        ip_address: row.get(8)?,
        error_message: row.get(9)?,
        metadata: metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

/// Aggregate counters returned by [`summary`].
#[derive(Debug, Clone, Default)]
pub struct AuditSummary {
    pub total: i64,
    pub by_credential: HashMap<String, i64>,
    pub by_entity: HashMap<String, i64>,
    pub by_action: HashMap<String, i64>,
    pub failed_access_count: i64,
    pub last_access_at: Option<DateTime<Utc>>,
}

/// Totals, per-credential/entity/action counts, failed-access count, and
/// the timestamp of the most recent audit entry.
pub fn summary(conn: &Connection) -> Result<AuditSummary> {
    let mut out = AuditSummary::default();

    out.total = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?;

    out.failed_access_count = conn.query_row(
        "SELECT COUNT(*) FROM audit_log WHERE action = 'retrieve' AND success = 0",
        [],
        |r| r.get(0),
    )?;

    let last_access_str: Option<String> = conn
        .query_row(
            "SELECT timestamp FROM audit_log ORDER BY timestamp DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?;
    out.last_access_at = last_access_str.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    });

    {
        let mut stmt =
            conn.prepare("SELECT credential_id, COUNT(*) FROM audit_log GROUP BY credential_id")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (k, v) = row?;
            out.by_credential.insert(k, v);
        }
    }
    {
        let mut stmt = conn
            .prepare("SELECT entity_id, COUNT(*) FROM audit_log GROUP BY entity_id")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (k, v) = row?;
            out.by_entity.insert(k, v);
        }
    }
    {
        let mut stmt = conn.prepare("SELECT action, COUNT(*) FROM audit_log GROUP BY action")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (k, v) = row?;
            out.by_action.insert(k, v);
        }
    }

    Ok(out)
}

/// Delete entries strictly older than `older_than_days`, returning the
/// number removed. Default retention window per spec §4.6 is 90 days.
pub fn cleanup_old_entries(conn: &Connection, older_than_days: i64) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
    let removed = conn.execute(
        "DELETE FROM audit_log WHERE timestamp < ?1",
        params![cutoff.to_rfc3339()],
    )?;
    Ok(removed)
}

/// Default retention window, per spec §4.6.
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::init(&conn).unwrap();
        conn
    }

    fn sample_entry<'a>(credential_id: &'a str, success: bool) -> LogEntry<'a> {
        LogEntry {
            credential_id,
            entity_id: "payment_skill",
            entity_type: EntityType::Skill,
            user_id: Some("user-1"),
            action: AuditAction::Retrieve,
            success,
            ip_address: Some("10.0.0.1"),
            error_message: if success { None } else { Some("denied") },
            metadata: None,
        }
    }

    #[test]
    fn log_then_query_round_trips() {
        let conn = conn();
        log(&conn, sample_entry("cred_1", true)).unwrap();
        let entries = query(&conn, &AuditQuery::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(entries[0].action, AuditAction::Retrieve);
    }

    #[test]
    fn query_orders_by_timestamp_desc_and_respects_limit() {
        let conn = conn();
        for _ in 0..5 {
            log(&conn, sample_entry("cred_1", true)).unwrap();
        }
        let entries = query(
            &conn,
            &AuditQuery {
                limit: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn summary_counts_failures_and_last_access() {
        let conn = conn();
        log(&conn, sample_entry("cred_1", true)).unwrap();
        log(&conn, sample_entry("cred_1", false)).unwrap();
        let s = summary(&conn).unwrap();
        assert_eq!(s.total, 2);
        assert_eq!(s.failed_access_count, 1);
        assert!(s.last_access_at.is_some());
        assert_eq!(s.by_credential.get("cred_1"), Some(&2));
    }

    #[test]
    fn cleanup_removes_only_entries_older_than_cutoff() {
        let conn = conn();
        log(&conn, sample_entry("cred_1", true)).unwrap();
        conn.execute(
            "UPDATE audit_log SET timestamp = ?1",
            params![(Utc::now() - chrono::Duration::days(120)).to_rfc3339()],
        )
        .unwrap();
        let removed = cleanup_old_entries(&conn, DEFAULT_RETENTION_DAYS).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(query(&conn, &AuditQuery::default()).unwrap().len(), 0);
    }
}
