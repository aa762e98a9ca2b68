// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cryptographic components: C1 (master key), C2 (KDF), C3 (cipher).

pub mod cipher;
pub mod kdf;
pub mod master_key;

pub use cipher::Envelope;
pub use kdf::{KdfParameters, KdfType, VaultConfig};
pub use master_key::{EnvMasterKeySource, MasterKeySource, StaticMasterKeySource, MASTER_KEY_LENGTH};
