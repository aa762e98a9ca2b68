// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Persistence schema: tables, views, and indexes (spec §6).
//!
//! `init` is idempotent (`CREATE TABLE IF NOT EXISTS`) and is meant to be
//! called once per opened connection, mirroring the "automatic migration on
//! open" idiom used by the SQLite-backed vault implementations in the
//! broader corpus.

use crate::error::Result;
use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS encryption_keys (
    id          TEXT PRIMARY KEY,
    key_hash    TEXT NOT NULL,
    algorithm   TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    status      TEXT NOT NULL,
    rotated_to  TEXT
);
CREATE INDEX IF NOT EXISTS idx_encryption_keys_status ON encryption_keys(status);

CREATE TABLE IF NOT EXISTS credentials (
    id                  TEXT PRIMARY KEY,
    name                TEXT NOT NULL,
    environment         TEXT NOT NULL,
    type                TEXT NOT NULL,
    service             TEXT NOT NULL,
    encrypted_value     TEXT NOT NULL,
    encryption_key_id    TEXT NOT NULL REFERENCES encryption_keys(id),
    metadata            TEXT NOT NULL DEFAULT '{}',
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    last_rotated_at     TEXT,
    status              TEXT NOT NULL,
    UNIQUE(name, environment)
);
CREATE INDEX IF NOT EXISTS idx_credentials_service ON credentials(service);
CREATE INDEX IF NOT EXISTS idx_credentials_type ON credentials(type);
CREATE INDEX IF NOT EXISTS idx_credentials_status ON credentials(status);
CREATE INDEX IF NOT EXISTS idx_credentials_environment ON credentials(environment);
CREATE INDEX IF NOT EXISTS idx_credentials_name ON credentials(name);

CREATE TABLE IF NOT EXISTS policies (
    id              TEXT PRIMARY KEY,
    credential_id   TEXT NOT NULL REFERENCES credentials(id) ON DELETE CASCADE,
    entity_id       TEXT NOT NULL,
    entity_type     TEXT NOT NULL,
    access_level    TEXT NOT NULL,
    granted_by      TEXT,
    granted_at      TEXT NOT NULL,
    expires_at      TEXT,
    reason          TEXT,
    UNIQUE(credential_id, entity_id, entity_type)
);
CREATE INDEX IF NOT EXISTS idx_policies_credential_id ON policies(credential_id);
CREATE INDEX IF NOT EXISTS idx_policies_entity ON policies(entity_id, entity_type);
CREATE INDEX IF NOT EXISTS idx_policies_expires_at ON policies(expires_at);
CREATE INDEX IF NOT EXISTS idx_policies_credential_entity ON policies(credential_id, entity_id, entity_type);

CREATE TABLE IF NOT EXISTS audit_log (
    id              TEXT PRIMARY KEY,
    credential_id   TEXT NOT NULL,
    entity_id       TEXT NOT NULL,
    entity_type     TEXT NOT NULL,
    user_id         TEXT,
    action          TEXT NOT NULL,
    success         INTEGER NOT NULL,
    timestamp       TEXT NOT NULL,
    ip_address      TEXT,
    error_message   TEXT,
    metadata        TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_credential_id ON audit_log(credential_id);
CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_id, entity_type);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action);
CREATE INDEX IF NOT EXISTS idx_audit_user_id ON audit_log(user_id);
CREATE INDEX IF NOT EXISTS idx_audit_success ON audit_log(success);

CREATE VIEW IF NOT EXISTS v_credentials_summary AS
SELECT
    c.id,
    c.name,
    c.environment,
    c.type,
    c.service,
    c.status,
    (SELECT COUNT(*) FROM policies p WHERE p.credential_id = c.id) AS policy_count,
    (SELECT COUNT(*) FROM audit_log a
        WHERE a.credential_id = c.id
          AND a.action = 'retrieve'
          AND a.success = 1
          AND a.timestamp >= datetime('now', '-30 days')
    ) AS successful_retrieves_30d
FROM credentials c;

CREATE VIEW IF NOT EXISTS v_recent_access AS
SELECT
    a.id,
    a.credential_id,
    c.name AS credential_name,
    c.service AS credential_service,
    a.entity_id,
    a.entity_type,
    a.user_id,
    a.action,
    a.success,
    a.timestamp,
    a.ip_address,
    a.error_message
FROM audit_log a
LEFT JOIN credentials c ON c.id = a.credential_id
ORDER BY a.timestamp DESC
LIMIT 100;

CREATE VIEW IF NOT EXISTS v_expired_policies AS
SELECT *
FROM policies
WHERE expires_at IS NOT NULL AND expires_at <= datetime('now');
"#;

/// Create every table, index, and view this crate owns if they don't
/// already exist. Safe to call on every connection open.
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();

        let table_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'credentials'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(table_count, 1);
    }

    #[test]
    fn views_are_queryable_on_an_empty_database() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();

        for view in [
            "v_credentials_summary",
            "v_recent_access",
            "v_expired_policies",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {view}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0);
        }
    }
}
