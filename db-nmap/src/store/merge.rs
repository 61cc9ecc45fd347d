use chrono::{DateTime, Utc};
use shared::protocol::{DEFAULT_OS_NAME, DEFAULT_PURPOSE, HOST_ALIVE};
use shared::types::{PersistedHost, ScanRecord};

/// How observed hostnames combine with the stored display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    /// Accumulate every hostname ever seen instead of keeping only the latest one.
    pub multiple_hostnames: bool,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            multiple_hostnames: true,
        }
    }
}

/// Column values written to a host row by one reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct HostFields {
    pub mac: Option<String>,
    pub name: Option<String>,
    pub state: String,
    pub os_name: String,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Merge a decoded record into the previously stored row (if any).
pub fn merge_host(
    existing: Option<&PersistedHost>,
    record: &ScanRecord,
    policy: MergePolicy,
    now: DateTime<Utc>,
) -> HostFields {
    let stored_name = existing.and_then(|h| h.name.as_deref());
    let name = if policy.multiple_hostnames {
        merge_hostnames(stored_name, &record.hostnames)
    } else {
        record
            .hostnames
            .first()
            .cloned()
            .or_else(|| stored_name.map(str::to_string))
    };

    let os_name = record
        .os_name()
        .or_else(|| existing.map(|h| h.os_name.as_str()))
        .unwrap_or(DEFAULT_OS_NAME);

    let purpose = record
        .purpose()
        .or_else(|| existing.map(|h| h.purpose.as_str()).filter(|p| !p.is_empty()))
        .unwrap_or(DEFAULT_PURPOSE);

    HostFields {
        mac: record.first_mac().or_else(|| existing.and_then(|h| h.mac.clone())),
        name,
        state: HOST_ALIVE.to_string(),
        os_name: os_name.to_string(),
        purpose: purpose.to_string(),
        created_at: existing.map_or(now, |h| h.created_at),
        updated_at: now,
    }
}

/// Union of the stored comma-joined names and the new ones: trimmed,
/// lower-cased, sorted and de-duplicated, joined with ", ".
///
/// Re-applying the same input leaves the result unchanged.
pub fn merge_hostnames(existing: Option<&str>, new: &[String]) -> Option<String> {
    let mut names: Vec<String> = existing
        .into_iter()
        .flat_map(|joined| joined.split(','))
        .chain(new.iter().map(String::as_str))
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    names.sort();
    names.dedup();

    if names.is_empty() {
        None
    } else {
        Some(names.join(", "))
    }
}
