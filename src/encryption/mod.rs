// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! # Field Encryption Engine
//!
//! Field-level encryption for regulated data, driven by a static policy
//! table. Four handling modes:
//!
//! - **Sealed** - authenticated encryption, ciphertext travels with the record
//! - **Tokenized** - ciphertext parked in a vault behind an opaque token
//! - **Format-preserving** - masked rendition in place, ciphertext out-of-band
//! - **Searchable** - additionally maintains a blind index for equality search
//!
//! Keys come from the [`crate::keys::KeyRegistry`]; rotation never breaks
//! existing ciphertext because every [`EncryptedField`] records the exact
//! key identity that sealed it.

pub mod blind_index;
pub mod engine;
pub mod policy;
pub mod vault;

pub use blind_index::BlindIndex;
pub use engine::{EncryptedField, EncryptedValue, FieldCipher, FieldError};
pub use policy::{FieldFormat, FieldPolicy, PolicyTable};
pub use vault::TokenVault;
