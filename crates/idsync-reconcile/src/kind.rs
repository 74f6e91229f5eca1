//! The content-kind table.
//!
//! Each kind is a row of data: its name, the ordered attribute fields that
//! make up its digest, the fields an import must supply, and two function
//! pointers (digest generator and validity accessor). Adding a kind means
//! adding a row to [`KINDS`], not a new type.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use idsync_types::{Attributes, ContentRow, Validity};

use crate::digest::DigestBuilder;

/// Per-kind behavior, as data.
#[derive(Debug)]
pub struct ContentKind {
    pub name: &'static str,
    /// Ordered fields hashed into the digest
    pub fields: &'static [&'static str],
    /// Fields a staged row must carry
    pub required: &'static [&'static str],
    pub digest: fn(&ContentRow) -> String,
    pub validity: fn(&ContentRow) -> Validity,
}

pub const USER: ContentKind = ContentKind {
    name: "USER",
    fields: &["login", "display_name", "email", "org_id"],
    required: &["login"],
    digest: user_digest,
    validity: stored_validity,
};

pub const ORGANIZATION: ContentKind = ContentKind {
    name: "ORGANIZATION",
    fields: &["name", "parent_id"],
    required: &["name"],
    digest: organization_digest,
    validity: unbounded_validity,
};

pub const GROUP: ContentKind = ContentKind {
    name: "GROUP",
    fields: &["name", "description", "org_id"],
    required: &["name"],
    digest: group_digest,
    validity: stored_validity,
};

pub const MEMBERSHIP: ContentKind = ContentKind {
    name: "MEMBERSHIP",
    fields: &["group_id", "member_id"],
    required: &["group_id", "member_id"],
    digest: membership_digest,
    validity: stored_validity,
};

/// Every known content kind.
pub static KINDS: [ContentKind; 4] = [USER, ORGANIZATION, GROUP, MEMBERSHIP];

fn user_digest(row: &ContentRow) -> String {
    row_digest(row, USER.fields, stored_validity(row))
}

fn organization_digest(row: &ContentRow) -> String {
    row_digest(row, ORGANIZATION.fields, unbounded_validity(row))
}

fn group_digest(row: &ContentRow) -> String {
    row_digest(row, GROUP.fields, stored_validity(row))
}

fn membership_digest(row: &ContentRow) -> String {
    row_digest(row, MEMBERSHIP.fields, stored_validity(row))
}

fn stored_validity(row: &ContentRow) -> Validity {
    row.validity
}

/// Organizations never expire.
fn unbounded_validity(_row: &ContentRow) -> Validity {
    Validity::always()
}

fn instant(at: Option<DateTime<Utc>>) -> Value {
    at.map(|t| Value::from(t.to_rfc3339()))
        .unwrap_or(Value::Null)
}

/// Hash of `(fields..., extra, enabled, validity_from, validity_to)`, where
/// `extra` is the object of every stored attribute not in `fields`.
fn row_digest(row: &ContentRow, fields: &[&str], validity: Validity) -> String {
    let mut builder = DigestBuilder::new();
    for field in fields {
        builder.field(row.attributes.get(*field).unwrap_or(&Value::Null));
    }
    let extra: Attributes = row
        .attributes
        .iter()
        .filter(|(key, _)| !fields.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    builder
        .field(&Value::Object(extra))
        .field(&Value::Bool(row.enabled))
        .field(&instant(validity.from))
        .field(&instant(validity.to));
    builder.finish()
}

impl ContentKind {
    /// Case-insensitive lookup by name.
    pub fn lookup(name: &str) -> Option<&'static ContentKind> {
        KINDS.iter().find(|k| k.name.eq_ignore_ascii_case(name))
    }

    pub fn all() -> &'static [ContentKind] {
        &KINDS
    }

    pub fn digest_of(&self, row: &ContentRow) -> String {
        (self.digest)(row)
    }

    pub fn validity_of(&self, row: &ContentRow) -> Validity {
        (self.validity)(row)
    }

    /// Recompute and store the row's digest.
    pub fn refresh(&self, row: &mut ContentRow) {
        row.digest = self.digest_of(row);
    }

    /// Required fields that are absent or null.
    pub fn missing_fields(&self, attributes: &Attributes) -> Vec<&'static str> {
        self.required
            .iter()
            .copied()
            .filter(|f| attributes.get(*f).map_or(true, Value::is_null))
            .collect()
    }

    /// Build a fully stamped row from source data. The stored validity is
    /// the kind's view of it, enabled follows that validity at `now`, and
    /// the digest is computed last.
    ///
    /// # Errors
    ///
    /// Returns a description of what is wrong with the record.
    pub fn prepare(
        &self,
        id: &str,
        attributes: Attributes,
        validity: Validity,
        now: DateTime<Utc>,
    ) -> Result<ContentRow, String> {
        if id.trim().is_empty() {
            return Err("empty id".to_string());
        }
        let missing = self.missing_fields(&attributes);
        if !missing.is_empty() {
            return Err(format!("missing required fields: {}", missing.join(", ")));
        }
        if let (Some(from), Some(to)) = (validity.from, validity.to) {
            if from > to {
                return Err("validity ends before it starts".to_string());
            }
        }

        let mut row = ContentRow {
            kind: self.name.to_string(),
            id: id.to_string(),
            enabled: true,
            digest: String::new(),
            validity,
            attributes,
        };
        row.validity = self.validity_of(&row);
        row.enabled = row.validity.contains(now);
        self.refresh(&mut row);
        Ok(row)
    }

    /// Soft-delete: disable the row and close its validity just before `at`,
    /// so a later rebuild does not consider it stale.
    pub fn retire(&self, row: &mut ContentRow, at: DateTime<Utc>) {
        let end = at - Duration::milliseconds(1);
        if row.validity.to.map_or(true, |to| to > end) {
            row.validity.to = Some(end);
        }
        if row.validity.from.is_some_and(|from| from > end) {
            row.validity.from = Some(end);
        }
        row.enabled = false;
        self.refresh(row);
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}
