//! Core domain model and change-detection primitives for Incentive Watch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "iwatch-core";

/// Fields compared between consecutive snapshots. Changes outside this list
/// still flip the content hash (and thus produce a new snapshot) but emit no
/// per-field change event.
pub const TRACKED_FIELDS: [&str; 11] = [
    "name",
    "program_type",
    "incentive_amount",
    "start_date",
    "end_date",
    "description",
    "eligible_sectors",
    "technologies",
    "implementing_sector",
    "contact",
    "website",
];

/// Canonical normalized catalog entry, independent of whether it came from
/// the structured API or the scrape fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramRecord {
    pub external_id: String,
    pub scope: Option<String>,
    pub name: Option<String>,
    pub program_type: Option<String>,
    pub implementing_sector: Option<String>,
    pub eligible_sectors: Option<String>,
    pub technologies: Option<String>,
    pub incentive_amount: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub date_enacted: Option<String>,
    pub description: Option<String>,
    pub contact: Option<String>,
    pub website: Option<String>,
    pub url: Option<String>,
    /// Attributes the normalizer did not recognize. They participate in the
    /// content hash so an upstream change is never silently dropped.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, JsonValue>,
    pub fetched_at: DateTime<Utc>,
}

impl ProgramRecord {
    pub fn new(external_id: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            external_id: external_id.into(),
            scope: None,
            name: None,
            program_type: None,
            implementing_sector: None,
            eligible_sectors: None,
            technologies: None,
            incentive_amount: None,
            start_date: None,
            end_date: None,
            date_enacted: None,
            description: None,
            contact: None,
            website: None,
            url: None,
            extra: BTreeMap::new(),
            fetched_at,
        }
    }

    /// Canonical attribute map used for hashing and snapshot payloads.
    ///
    /// `fetched_at` is excluded: re-fetching identical content must hash
    /// identically. Key order is stable because the map is a `BTreeMap`.
    pub fn attribute_map(&self) -> BTreeMap<String, JsonValue> {
        let mut map = self.extra.clone();
        let mut put = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                map.insert(key.to_string(), JsonValue::String(v.clone()));
            }
        };
        put("scope", &self.scope);
        put("name", &self.name);
        put("program_type", &self.program_type);
        put("implementing_sector", &self.implementing_sector);
        put("eligible_sectors", &self.eligible_sectors);
        put("technologies", &self.technologies);
        put("incentive_amount", &self.incentive_amount);
        put("start_date", &self.start_date);
        put("end_date", &self.end_date);
        put("date_enacted", &self.date_enacted);
        put("description", &self.description);
        put("contact", &self.contact);
        put("website", &self.website);
        put("url", &self.url);
        map.insert(
            "external_id".to_string(),
            JsonValue::String(self.external_id.clone()),
        );
        map
    }

    /// SHA-256 hex digest over the canonical attribute map.
    pub fn content_hash(&self) -> String {
        hash_attributes(&self.attribute_map())
    }

    /// Value of one tracked field, stringified for diffing.
    pub fn tracked_value(&self, field: &str) -> Option<String> {
        let v = match field {
            "name" => &self.name,
            "program_type" => &self.program_type,
            "incentive_amount" => &self.incentive_amount,
            "start_date" => &self.start_date,
            "end_date" => &self.end_date,
            "description" => &self.description,
            "eligible_sectors" => &self.eligible_sectors,
            "technologies" => &self.technologies,
            "implementing_sector" => &self.implementing_sector,
            "contact" => &self.contact,
            "website" => &self.website,
            _ => return None,
        };
        v.clone()
    }

    /// Normalize a structured API payload into a canonical record. The
    /// upstream endpoint is inconsistent about key names, so each field is
    /// resolved through its known aliases. Returns `None` when no usable
    /// identifier is present.
    pub fn from_api_value(
        value: &JsonValue,
        fallback_scope: Option<&str>,
        fetched_at: DateTime<Utc>,
    ) -> Option<Self> {
        let external_id = string_at(value, &["id", "program_id"])?;
        let mut record = Self::new(external_id, fetched_at);
        record.scope = string_at(value, &["state", "state_code"])
            .map(|s| s.to_ascii_uppercase())
            .or_else(|| fallback_scope.map(|s| s.to_ascii_uppercase()));
        record.name = string_at(value, &["name", "program_name"]);
        record.program_type = string_at(value, &["program_type", "type"]);
        record.implementing_sector = string_at(value, &["implementing_sector", "sector"]);
        record.eligible_sectors = string_at(value, &["eligible_sectors"]);
        record.technologies = string_at(value, &["technologies", "eligible_technologies"]);
        record.incentive_amount = string_at(value, &["incentive_amount", "amount"]);
        record.start_date = string_at(value, &["start_date", "effective_date"]);
        record.end_date = string_at(value, &["end_date", "expiration_date"]);
        record.date_enacted = string_at(value, &["date_enacted", "enacted_date"]);
        record.description = string_at(value, &["description", "summary"]);
        record.contact = string_at(value, &["contact"]);
        record.website = string_at(value, &["website", "web_site"]);
        record.url = string_at(value, &["url"]);

        if let Some(obj) = value.as_object() {
            for (key, val) in obj {
                if !KNOWN_API_KEYS.contains(&key.as_str()) && !val.is_null() {
                    record.extra.insert(key.clone(), val.clone());
                }
            }
        }
        Some(record)
    }
}

const KNOWN_API_KEYS: [&str; 26] = [
    "id",
    "program_id",
    "state",
    "state_code",
    "name",
    "program_name",
    "program_type",
    "type",
    "implementing_sector",
    "sector",
    "eligible_sectors",
    "technologies",
    "eligible_technologies",
    "incentive_amount",
    "amount",
    "start_date",
    "effective_date",
    "end_date",
    "expiration_date",
    "date_enacted",
    "enacted_date",
    "description",
    "summary",
    "contact",
    "website",
    "url",
];

/// Resolve the first non-empty string among alias keys. Numbers are accepted
/// and stringified (the API serves ids both quoted and bare), arrays are
/// joined with a comma.
fn string_at(value: &JsonValue, aliases: &[&str]) -> Option<String> {
    for key in aliases {
        match value.get(*key) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => {
                return Some(s.trim().to_string());
            }
            Some(JsonValue::Number(n)) => return Some(n.to_string()),
            Some(JsonValue::Array(items)) => {
                let joined = items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(", ");
                if !joined.is_empty() {
                    return Some(joined);
                }
            }
            _ => {}
        }
    }
    None
}

/// Stable hash over a canonical attribute map.
pub fn hash_attributes(map: &BTreeMap<String, JsonValue>) -> String {
    let canonical = serde_json::to_string(map).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// One field-level difference between two consecutive observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Diff two records restricted to [`TRACKED_FIELDS`]. Unchanged fields emit
/// nothing; an absent value is represented as `None`.
pub fn diff_tracked_fields(old: &ProgramRecord, new: &ProgramRecord) -> Vec<FieldChange> {
    TRACKED_FIELDS
        .iter()
        .filter_map(|field| {
            let old_value = old.tracked_value(field);
            let new_value = new.tracked_value(field);
            if old_value == new_value {
                None
            } else {
                Some(FieldChange {
                    field: (*field).to_string(),
                    old_value,
                    new_value,
                })
            }
        })
        .collect()
}

/// Same diff, operating on stored snapshot payloads (canonical attribute
/// maps) instead of live records.
pub fn diff_tracked_maps(
    old: &BTreeMap<String, JsonValue>,
    new: &BTreeMap<String, JsonValue>,
) -> Vec<FieldChange> {
    let stringify = |map: &BTreeMap<String, JsonValue>, field: &str| -> Option<String> {
        map.get(field).map(|v| match v {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
    };
    TRACKED_FIELDS
        .iter()
        .filter_map(|field| {
            let old_value = stringify(old, field);
            let new_value = stringify(new, field);
            if old_value == new_value {
                None
            } else {
                Some(FieldChange {
                    field: (*field).to_string(),
                    old_value,
                    new_value,
                })
            }
        })
        .collect()
}
