//! Session-scoped roster snapshot.
//!
//! Joins the identity manifest (one folder per enrolled face) against the
//! student directory (JSON keyed by student id). The resulting index is
//! immutable: a running session never observes roster edits.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::types::{ClassContext, StudentRecord, UNKNOWN_CLASS, UNKNOWN_ROLL_NO};

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("identity manifest not found: {0}")]
    ManifestNotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed student directory {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The set of identity labels the recognizer was enrolled with.
#[derive(Debug, Clone, Default)]
pub struct IdentityManifest {
    labels: BTreeSet<String>,
}

impl IdentityManifest {
    /// Enumerate identity folders under `dir`. Plain files are ignored.
    pub fn scan(dir: &Path) -> Result<Self, RosterError> {
        if !dir.is_dir() {
            return Err(RosterError::ManifestNotFound(dir.to_path_buf()));
        }
        let io_err = |source| RosterError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut labels = BTreeSet::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_dir() {
                continue;
            }
            labels.insert(entry.file_name().to_string_lossy().into_owned());
        }

        tracing::debug!(dir = %dir.display(), count = labels.len(), "scanned identity manifest");
        Ok(Self { labels })
    }

    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

/// One value of the student directory JSON object.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default = "unknown_roll_no")]
    pub roll_no: String,
    #[serde(default = "unknown_class")]
    pub branch: String,
    #[serde(default = "unknown_class")]
    pub section: String,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn unknown_roll_no() -> String {
    UNKNOWN_ROLL_NO.to_string()
}

fn unknown_class() -> String {
    UNKNOWN_CLASS.to_string()
}

/// Student directory keyed by student id.
#[derive(Debug, Clone, Default)]
pub struct StudentDirectory {
    entries: BTreeMap<String, StudentEntry>,
}

impl StudentDirectory {
    /// Load the directory from a JSON file. A missing file is an empty directory.
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "student directory not found; roster will be unresolved");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(RosterError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_json(&raw).map_err(|source| RosterError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            entries: serde_json::from_str(raw)?,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve an identity label: exact key, enrollment key, then
    /// case-insensitive name. Keys are visited in sorted order.
    fn resolve(&self, label: &str) -> Option<&StudentEntry> {
        self.entries
            .get(label)
            .or_else(|| self.entries.get(&enrollment_key(label)))
            .or_else(|| {
                self.entries
                    .values()
                    .find(|entry| entry.name.to_lowercase() == label.to_lowercase())
            })
    }
}

/// Student id form enrollment derives from a display name.
pub fn enrollment_key(label: &str) -> String {
    label.to_lowercase().replace(' ', "_")
}

/// Immutable label -> student mapping for one session.
#[derive(Debug, Clone, Default)]
pub struct RosterIndex {
    records: HashMap<String, StudentRecord>,
}

impl RosterIndex {
    pub fn build(manifest: &IdentityManifest, directory: &StudentDirectory) -> Self {
        let mut records = HashMap::with_capacity(manifest.len());
        let mut unresolved = 0usize;

        for label in manifest.labels() {
            let record = match directory.resolve(label) {
                Some(entry) => StudentRecord {
                    label: label.to_string(),
                    name: if entry.name.is_empty() {
                        label.to_string()
                    } else {
                        entry.name.clone()
                    },
                    roll_no: entry.roll_no.clone(),
                    branch: entry.branch.clone(),
                    section: entry.section.clone(),
                    metadata: entry.metadata.clone(),
                },
                None => {
                    unresolved += 1;
                    tracing::warn!(label, "identity has no student record; binding placeholder");
                    StudentRecord::unknown(label)
                }
            };
            records.insert(label.to_string(), record);
        }

        let mut labels_by_student: HashMap<&str, Vec<&str>> = HashMap::new();
        for record in records.values().filter(|r| !r.is_unknown()) {
            labels_by_student
                .entry(record.student_key())
                .or_default()
                .push(&record.label);
        }
        for (student, mut labels) in labels_by_student {
            if labels.len() > 1 {
                labels.sort_unstable();
                tracing::warn!(student, ?labels, "several identities resolve to one student");
            }
        }

        tracing::info!(
            identities = records.len(),
            students = directory.len(),
            unresolved,
            "roster index built"
        );
        Self { records }
    }

    /// Scan the manifest folder, load the directory file, and build.
    pub fn load(dataset_dir: &Path, student_db: &Path) -> Result<Self, RosterError> {
        let manifest = IdentityManifest::scan(dataset_dir)?;
        let directory = StudentDirectory::load(student_db)?;
        Ok(Self::build(&manifest, &directory))
    }

    /// Total lookup: labels outside the index get the unknown placeholder.
    pub fn lookup(&self, label: &str) -> Cow<'_, StudentRecord> {
        match self.records.get(label) {
            Some(record) => Cow::Borrowed(record),
            None => Cow::Owned(StudentRecord::unknown(label)),
        }
    }

    /// Distinct students enrolled in a class.
    pub fn class_member_count(&self, context: &ClassContext) -> usize {
        self.class_members(context).len()
    }

    /// Students of a class, sorted by name. A student reachable through
    /// several labels appears once, under the lowest label.
    pub fn class_members(&self, context: &ClassContext) -> Vec<&StudentRecord> {
        let mut members: Vec<&StudentRecord> =
            self.records.values().filter(|r| context.contains(r)).collect();
        members.sort_by(|a, b| {
            a.student_key()
                .cmp(b.student_key())
                .then_with(|| a.label.cmp(&b.label))
        });
        members.dedup_by(|later, first| later.student_key() == first.student_key());
        members.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.roll_no.cmp(&b.roll_no)));
        members
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIRECTORY: &str = r#"{
        "asha_rao": {"name": "Asha Rao", "rollNo": "CSEA001", "branch": "CSE", "section": "A",
                     "registeredDate": "2026-01-10 10:00:00", "imagesCount": 50},
        "s-17": {"name": "Vikram Iyer", "rollNo": "CSEA002", "branch": "CSE", "section": "A"},
        "meera": {"name": "Meera Das", "rollNo": "ECEB004", "branch": "ECE", "section": "B"}
    }"#;

    fn index() -> RosterIndex {
        let manifest = IdentityManifest::from_labels(["Asha Rao", "VIKRAM IYER", "meera", "Ghost"]);
        let directory = StudentDirectory::from_json(DIRECTORY).unwrap();
        RosterIndex::build(&manifest, &directory)
    }

    #[test]
    fn test_resolves_by_enrollment_key() {
        let idx = index();
        let rec = idx.lookup("Asha Rao");
        assert_eq!(rec.roll_no, "CSEA001");
        assert_eq!(rec.metadata.get("imagesCount"), Some(&serde_json::json!(50)));
    }

    #[test]
    fn test_resolves_by_exact_key() {
        let idx = index();
        assert_eq!(idx.lookup("meera").roll_no, "ECEB004");
        assert_eq!(idx.lookup("meera").name, "Meera Das");
    }

    #[test]
    fn test_resolves_by_case_insensitive_name() {
        let idx = index();
        let rec = idx.lookup("VIKRAM IYER");
        assert_eq!(rec.roll_no, "CSEA002");
        assert_eq!(rec.label, "VIKRAM IYER");
    }

    #[test]
    fn test_unresolved_manifest_label_gets_placeholder() {
        let idx = index();
        let rec = idx.lookup("Ghost");
        assert!(rec.is_unknown());
        assert_eq!(rec.roll_no, "N/A");
    }

    #[test]
    fn test_lookup_is_total() {
        let idx = index();
        for label in ["", "nobody", "asha_rao", "🙂"] {
            let rec = idx.lookup(label);
            assert!(rec.is_unknown(), "{label} should be unknown");
            assert_eq!(rec.label, label);
        }
    }

    #[test]
    fn test_class_member_count() {
        let idx = index();
        assert_eq!(idx.class_member_count(&ClassContext::new("cse", "a")), 2);
        assert_eq!(idx.class_member_count(&ClassContext::new("ECE", "B")), 1);
        assert_eq!(idx.class_member_count(&ClassContext::new("MECH", "A")), 0);
        // Placeholders never form a class.
        assert_eq!(idx.class_member_count(&ClassContext::new("UNKNOWN", "UNKNOWN")), 0);
    }

    #[test]
    fn test_class_members_sorted_by_name() {
        let idx = index();
        let names: Vec<&str> = idx
            .class_members(&ClassContext::new("CSE", "A"))
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["Asha Rao", "Vikram Iyer"]);
    }

    #[test]
    fn test_student_reached_by_two_labels_counted_once() {
        let idx = RosterIndex::build(
            &IdentityManifest::from_labels(["Asha Rao", "asha_rao", "Vikram Iyer"]),
            &StudentDirectory::from_json(DIRECTORY).unwrap(),
        );
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.lookup("asha_rao").roll_no, "CSEA001");
        assert_eq!(idx.lookup("Asha Rao").roll_no, "CSEA001");

        let cse_a = ClassContext::new("CSE", "A");
        assert_eq!(idx.class_member_count(&cse_a), 2);
        let labels: Vec<&str> = idx.class_members(&cse_a).iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["Asha Rao", "Vikram Iyer"]);
    }

    #[test]
    fn test_unresolved_labels_stay_distinct_students() {
        let idx = RosterIndex::build(
            &IdentityManifest::from_labels(["Walk In", "Visitor"]),
            &StudentDirectory::from_json(DIRECTORY).unwrap(),
        );
        assert_ne!(
            idx.lookup("Walk In").student_key(),
            idx.lookup("Visitor").student_key()
        );
    }

    #[test]
    fn test_entry_defaults_for_missing_fields() {
        let directory = StudentDirectory::from_json(r#"{"x": {"name": "X"}}"#).unwrap();
        let idx = RosterIndex::build(&IdentityManifest::from_labels(["x"]), &directory);
        let rec = idx.lookup("x");
        assert_eq!(rec.roll_no, "N/A");
        assert_eq!(rec.branch, "UNKNOWN");
    }

    #[test]
    fn test_scan_manifest_ignores_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Asha Rao")).unwrap();
        std::fs::create_dir(dir.path().join("meera")).unwrap();
        std::fs::write(dir.path().join("README.txt"), "not an identity").unwrap();

        let manifest = IdentityManifest::scan(dir.path()).unwrap();
        let labels: Vec<&str> = manifest.labels().collect();
        assert_eq!(labels, vec!["Asha Rao", "meera"]);
    }

    #[test]
    fn test_scan_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = IdentityManifest::scan(&dir.path().join("dataset")).unwrap_err();
        assert!(matches!(err, RosterError::ManifestNotFound(_)));
    }

    #[test]
    fn test_load_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let directory = StudentDirectory::load(&dir.path().join("students.json")).unwrap();
        assert!(directory.is_empty());
    }

    #[test]
    fn test_load_malformed_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("students.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = StudentDirectory::load(&path).unwrap_err();
        assert!(matches!(err, RosterError::Malformed { .. }));
    }
}
