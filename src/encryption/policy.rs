// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Per-field encryption policy.
//!
//! The mapping from logical field name to sensitivity and handling flags is
//! static configuration, not runtime state. Fields absent from the table
//! pass through the engine unchanged.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::keys::Sensitivity;

/// Recognizable shapes for format-preserving handling.
///
/// The masked rendition is cosmetic: the true value is always stored
/// out-of-band under AEAD. Swapping in a real format-preserving cipher
/// would replace [`FieldFormat::mask`] alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FieldFormat {
    Date,
    Phone,
    Email,
}

impl FieldFormat {
    /// Produce the masked rendition of a value.
    pub fn mask(&self, value: &str) -> String {
        match self {
            // Keep the year, mask month and day: `1990-**-**`.
            FieldFormat::Date => {
                let year: String = value.chars().take(4).collect();
                if year.len() == 4 && year.chars().all(|c| c.is_ascii_digit()) {
                    format!("{year}-**-**")
                } else {
                    value.chars().map(|_| '*').collect()
                }
            }
            // Mask all digits except the last four, keep punctuation.
            FieldFormat::Phone => {
                let digit_count = value.chars().filter(|c| c.is_ascii_digit()).count();
                let mut seen = 0;
                value
                    .chars()
                    .map(|c| {
                        if c.is_ascii_digit() {
                            seen += 1;
                            if seen + 4 > digit_count {
                                c
                            } else {
                                '*'
                            }
                        } else {
                            c
                        }
                    })
                    .collect()
            }
            // Keep the first character and the domain: `j***@example.org`.
            FieldFormat::Email => match value.split_once('@') {
                Some((local, domain)) => {
                    let first = local.chars().next().unwrap_or('*');
                    format!("{first}***@{domain}")
                }
                None => value.chars().map(|_| '*').collect(),
            },
        }
    }
}

/// Handling policy for one logical field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FieldPolicy {
    pub sensitivity: Sensitivity,
    /// Store ciphertext in the vault and hand out an opaque token instead.
    #[serde(default)]
    pub tokenized: bool,
    /// Return a masked rendition while the ciphertext lives out-of-band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FieldFormat>,
    /// Maintain a blind index for equality search.
    #[serde(default)]
    pub searchable: bool,
}

impl FieldPolicy {
    pub fn new(sensitivity: Sensitivity) -> Self {
        Self {
            sensitivity,
            tokenized: false,
            format: None,
            searchable: false,
        }
    }

    pub fn tokenized(mut self) -> Self {
        self.tokenized = true;
        self
    }

    pub fn with_format(mut self, format: FieldFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }
}

/// The static field-name → policy table.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    fields: HashMap<String, FieldPolicy>,
}

impl PolicyTable {
    pub fn empty() -> Self {
        Self {
            fields: HashMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldPolicy> {
        self.fields.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, policy: FieldPolicy) {
        self.fields.insert(field.into(), policy);
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

impl Default for PolicyTable {
    /// The platform's regulated-field catalog.
    fn default() -> Self {
        use FieldFormat::*;
        use Sensitivity::*;

        let mut table = Self::empty();

        // Clinical records
        table.insert("diagnosis", FieldPolicy::new(Critical));
        table.insert("medications", FieldPolicy::new(Critical));
        table.insert("therapy_notes", FieldPolicy::new(Critical).searchable());
        table.insert("crisis_notes", FieldPolicy::new(Critical));
        table.insert("safety_plan", FieldPolicy::new(High));
        table.insert("journal_entry", FieldPolicy::new(High).searchable());

        // Identity and contact
        table.insert(
            "insurance_member_id",
            FieldPolicy::new(Critical).tokenized(),
        );
        table.insert("date_of_birth", FieldPolicy::new(High).with_format(Date));
        table.insert("phone_number", FieldPolicy::new(Medium).with_format(Phone));
        table.insert(
            "emergency_contact_phone",
            FieldPolicy::new(Medium).with_format(Phone),
        );
        table.insert("emergency_contact_name", FieldPolicy::new(Medium));
        table.insert(
            "email",
            FieldPolicy::new(Medium).with_format(Email).searchable(),
        );

        // Sensitive session attributes (persisted session snapshots)
        table.insert("session_origin", FieldPolicy::new(Medium));
        table.insert("session_client_signature", FieldPolicy::new(Medium));

        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_covers_clinical_fields() {
        let table = PolicyTable::default();
        assert_eq!(
            table.get("diagnosis").unwrap().sensitivity,
            Sensitivity::Critical
        );
        assert!(table.get("journal_entry").unwrap().searchable);
        assert!(table.get("insurance_member_id").unwrap().tokenized);
        assert!(table.get("mood_color").is_none());
    }

    #[test]
    fn date_mask_keeps_year() {
        assert_eq!(FieldFormat::Date.mask("1990-04-17"), "1990-**-**");
        assert_eq!(FieldFormat::Date.mask("apr 17"), "******");
    }

    #[test]
    fn phone_mask_keeps_last_four_digits() {
        assert_eq!(FieldFormat::Phone.mask("(555) 867-5309"), "(***) ***-5309");
        assert_eq!(FieldFormat::Phone.mask("5551234567"), "******4567");
    }

    #[test]
    fn email_mask_keeps_first_char_and_domain() {
        assert_eq!(
            FieldFormat::Email.mask("jordan@example.org"),
            "j***@example.org"
        );
        assert_eq!(FieldFormat::Email.mask("not-an-email"), "************");
    }
}
