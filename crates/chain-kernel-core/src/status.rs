use serde::{Deserialize, Serialize};

/// Current and target schema versions of a persisted store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub backend: String,
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    /// Chain order recorded at first migration, if any.
    pub order: Option<usize>,
}

impl SchemaStatus {
    #[must_use]
    pub fn new(
        backend: &str,
        current_version: i64,
        target_version: i64,
        order: Option<usize>,
    ) -> Self {
        let pending_versions = if current_version < target_version {
            ((current_version + 1)..=target_version).collect()
        } else {
            Vec::new()
        };
        Self {
            backend: backend.to_string(),
            current_version,
            target_version,
            pending_versions,
            order,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Chain entries whose message record is missing.
    pub orphaned_entries: usize,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok && self.foreign_key_violations.is_empty() && self.orphaned_entries == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_versions_cover_the_gap() {
        let status = SchemaStatus::new("relational", 0, 2, None);
        assert_eq!(status.pending_versions, vec![1, 2]);
        let current = SchemaStatus::new("relational", 2, 2, Some(3));
        assert!(current.pending_versions.is_empty());
    }
}
