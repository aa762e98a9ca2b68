// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Integration tests for the credential store's CRUD surface, driven
//! through the public `Vault` API against an on-disk SQLite file so the
//! "closed and reopened" case is exercised, not just an in-memory handle.

use ah_credentials_vault::crypto::master_key::StaticMasterKeySource;
use ah_credentials_vault::types::CredentialStatus;
use ah_credentials_vault::{AccessLevel, CredentialValue, EntityType, ListFilters, RetrieveOptions, Vault};
use serde_json::Map;
use std::sync::Arc;
use tempfile::NamedTempFile;

fn open_on_disk() -> (Vault, NamedTempFile, Arc<StaticMasterKeySource>) {
    let file = NamedTempFile::new().unwrap();
    let source = Arc::new(StaticMasterKeySource::new([21u8; 32]));
    let vault = Vault::open(file.path(), source.clone()).unwrap();
    (vault, file, source)
}

#[test]
fn credential_survives_closing_and_reopening_the_same_file() {
    let (vault, file, source) = open_on_disk();
    let id = vault
        .store(
            "ssh_deploy_key",
            "production",
            "deploy-host",
            &CredentialValue::SshKey {
                private_key: "-----BEGIN KEY-----".into(),
                public_key: Some("ssh-ed25519 AAAA...".into()),
                passphrase: None,
            },
            Map::new(),
            None,
            None,
        )
        .unwrap();
    vault
        .grant_access(&id, "deploy_tool", EntityType::Tool, AccessLevel::Read, None, None, None)
        .unwrap();
    drop(vault);

    let reopened = Vault::open(file.path(), source).unwrap();
    let retrieved = reopened
        .retrieve(&id, "deploy_tool", EntityType::Tool, RetrieveOptions::default())
        .unwrap();
    assert!(matches!(retrieved.value, CredentialValue::SshKey { .. }));
}

#[test]
fn rotated_credential_is_unreadable_with_the_value_it_replaced() {
    let (vault, _file, _source) = open_on_disk();
    let id = vault
        .store(
            "basic_auth_svc",
            "production",
            "internal-api",
            &CredentialValue::BasicAuth { user: "svc".into(), password: "old-pass".into() },
            Map::new(),
            None,
            None,
        )
        .unwrap();

    vault
        .rotate(&id, &CredentialValue::BasicAuth { user: "svc".into(), password: "new-pass".into() }, None)
        .unwrap();
    vault
        .grant_access(&id, "caller", EntityType::Tool, AccessLevel::Read, None, None, None)
        .unwrap();

    let retrieved = vault
        .retrieve(&id, "caller", EntityType::Tool, RetrieveOptions::default())
        .unwrap();
    match retrieved.value {
        CredentialValue::BasicAuth { password, .. } => assert_eq!(password, "new-pass"),
        _ => panic!("expected basic auth"),
    }
}

#[test]
fn revoked_credential_is_not_retrievable_but_metadata_and_audit_remain() {
    let (vault, _file, _source) = open_on_disk();
    let id = vault
        .store(
            "oauth_app",
            "production",
            "some-saas",
            &CredentialValue::OauthToken {
                access: "access-tok".into(),
                refresh: Some("refresh-tok".into()),
                expires_at: None,
                token_type: Some("Bearer".into()),
                scopes: Some(vec!["read".into()]),
            },
            Map::new(),
            None,
            None,
        )
        .unwrap();
    vault
        .grant_access(&id, "caller", EntityType::Tool, AccessLevel::Read, None, None, None)
        .unwrap();

    vault.revoke(&id, Some("key compromised"), Some("security_team")).unwrap();

    let err = vault
        .retrieve(&id, "caller", EntityType::Tool, RetrieveOptions::default())
        .unwrap_err();
    assert_eq!(err.class(), "not_found");

    let metadata = vault.get_by_name("oauth_app", "production").unwrap().unwrap();
    assert_eq!(metadata.status, CredentialStatus::Revoked);
    assert_eq!(
        metadata.metadata.get("revokedReason").and_then(|v| v.as_str()),
        Some("key compromised")
    );
}

#[test]
fn storing_a_duplicate_name_and_environment_is_a_conflict_but_different_environments_are_fine() {
    let (vault, _file, _source) = open_on_disk();
    let value = CredentialValue::ApiKey { key: "k".into(), secret: None };
    vault.store("shared_name", "staging", "svc", &value, Map::new(), None, None).unwrap();

    let conflict = vault.store("shared_name", "staging", "svc", &value, Map::new(), None, None).unwrap_err();
    assert_eq!(conflict.class(), "conflict");

    // Same name, different environment: allowed.
    vault.store("shared_name", "production", "svc", &value, Map::new(), None, None).unwrap();
}

#[test]
fn list_and_count_respect_the_same_filters() {
    let (vault, _file, _source) = open_on_disk();
    let value = CredentialValue::ApiKey { key: "k".into(), secret: None };
    vault.store("svc_a", "production", "stripe", &value, Map::new(), None, None).unwrap();
    vault.store("svc_b", "production", "stripe", &value, Map::new(), None, None).unwrap();
    vault.store("svc_c", "production", "github", &value, Map::new(), None, None).unwrap();

    let filters = ListFilters {
        service: Some("stripe"),
        ..Default::default()
    };
    assert_eq!(vault.list(&filters).unwrap().len(), 2);
    assert_eq!(vault.count(&filters).unwrap(), 2);
}

#[test]
fn hard_delete_cascades_policies_and_audit_but_list_no_longer_sees_the_row() {
    let (vault, _file, _source) = open_on_disk();
    let value = CredentialValue::ApiKey { key: "k".into(), secret: None };
    let id = vault.store("to_delete", "production", "svc", &value, Map::new(), None, None).unwrap();
    vault
        .grant_access(&id, "caller", EntityType::Tool, AccessLevel::Read, None, None, None)
        .unwrap();

    vault.delete(&id).unwrap();

    assert!(vault.get_by_name("to_delete", "production").unwrap().is_none());
    assert!(vault.get_access_policies(&id).unwrap().is_empty());
    assert!(vault.audit_query(&Default::default()).unwrap().iter().all(|e| e.credential_id != id));
}
