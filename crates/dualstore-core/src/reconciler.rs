//! Store-to-store reconciliation.
//!
//! [`Reconciler::compare`] works on two plaintext stores.
//! [`Reconciler::compare_encrypted`] first decrypts both ciphertexts into
//! temporary copies, and those copies are removed on every exit path.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cipher_store::{CipherStore, DecryptMode};
use crate::error::{Result, SyncError};
use crate::paths::{plain_path_for, CIPHER_SUFFIX, DEFAULT_TABLE};
use crate::record_set::{Record, RecordSet};
use crate::settings::SyncSettings;
use crate::sources::StoreKind;
use crate::temp_artifact::TemporaryArtifact;

/// A store on one side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRef {
    pub path: PathBuf,
    pub kind: StoreKind,
}

impl StoreRef {
    pub fn new(path: impl AsRef<Path>, kind: StoreKind) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            kind,
        }
    }

    /// Infer the kind from the path's extension.
    pub fn infer(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self::new(path, StoreKind::infer(path, table)?))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconReport {
    pub left: String,
    pub right: String,
    pub compared_fields: Vec<String>,
    /// Fields only the left store has.
    pub unmatched_left_fields: Vec<String>,
    /// Fields only the right store has.
    pub unmatched_right_fields: Vec<String>,
    pub left_rows: usize,
    pub right_rows: usize,
    pub only_in_left: Vec<Record>,
    pub only_in_right: Vec<Record>,
    pub warnings: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl ReconReport {
    pub fn is_consistent(&self) -> bool {
        self.only_in_left.is_empty() && self.only_in_right.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    table: String,
    scratch_dir: PathBuf,
    suffix: String,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            scratch_dir: std::env::temp_dir(),
            suffix: CIPHER_SUFFIX.to_string(),
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            table: settings.table.clone(),
            scratch_dir: settings.scratch_dir(),
            suffix: settings.cipher_suffix.clone(),
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.scratch_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Compare two plaintext stores.
    ///
    /// Every column of `a` must exist in `b`; `b` may carry extra columns,
    /// which are listed in the report but not compared.
    pub fn compare(&self, a: &StoreRef, b: &StoreRef) -> Result<ReconReport> {
        let left = RecordSet::load(&a.path, &a.kind)?;
        let right = RecordSet::load(&b.path, &b.kind)?;

        let absent = left.fields_missing_from(&right);
        if !absent.is_empty() {
            return Err(SyncError::MissingColumns {
                store: right.label().to_string(),
                columns: absent,
            });
        }

        let fields: BTreeSet<String> = left.fields().iter().cloned().collect();
        let report = build_report(&left, &right, &fields, left.label(), right.label())?;
        log_outcome(&report);
        Ok(report)
    }

    /// Compare two encrypted stores using `key` for both.
    ///
    /// Inputs are checked up front and every missing one is named. The
    /// comparison runs over the fields both stores share.
    pub fn compare_encrypted(
        &self,
        cipher_a: &Path,
        cipher_b: &Path,
        key: &Path,
    ) -> Result<ReconReport> {
        let missing: Vec<PathBuf> = [cipher_a, cipher_b, key]
            .into_iter()
            .filter(|p| !p.is_file())
            .map(Path::to_path_buf)
            .collect();
        if !missing.is_empty() {
            return Err(SyncError::MissingInput(missing));
        }

        let kind_a = self.kind_of_cipher(cipher_a)?;
        let kind_b = self.kind_of_cipher(cipher_b)?;

        let temp_a = TemporaryArtifact::allocate(
            &self.scratch_dir,
            "left",
            &extension_of_cipher(cipher_a, &self.suffix),
        );
        let temp_b = TemporaryArtifact::allocate(
            &self.scratch_dir,
            "right",
            &extension_of_cipher(cipher_b, &self.suffix),
        );

        let store = CipherStore::new(key).with_suffix(self.suffix.clone());
        let outcome = self.compare_decrypted(
            &store,
            (cipher_a, &kind_a, &temp_a),
            (cipher_b, &kind_b, &temp_b),
        );

        let report = settle(outcome, [temp_a, temp_b])?;
        log_outcome(&report);
        Ok(report)
    }

    fn compare_decrypted(
        &self,
        store: &CipherStore,
        (cipher_a, kind_a, temp_a): (&Path, &StoreKind, &TemporaryArtifact),
        (cipher_b, kind_b, temp_b): (&Path, &StoreKind, &TemporaryArtifact),
    ) -> Result<ReconReport> {
        fs::create_dir_all(&self.scratch_dir).map_err(|e| SyncError::io(&self.scratch_dir, e))?;

        for (cipher, temp) in [(cipher_a, temp_a), (cipher_b, temp_b)] {
            store.decrypt(cipher, Some(temp.path()), DecryptMode::Suppressed)?;
            ensure_not_empty(temp.path(), cipher)?;
            debug!(
                artifact = %cipher.display(),
                temp = %temp.path().display(),
                "staged transient copy"
            );
        }

        let left =
            RecordSet::load(temp_a.path(), kind_a).map_err(|e| attribute_to(e, cipher_a))?;
        let right =
            RecordSet::load(temp_b.path(), kind_b).map_err(|e| attribute_to(e, cipher_b))?;
        let fields = left.common_fields(&right);

        build_report(
            &left,
            &right,
            &fields,
            &cipher_a.display().to_string(),
            &cipher_b.display().to_string(),
        )
    }

    fn kind_of_cipher(&self, cipher: &Path) -> Result<StoreKind> {
        let plain = plain_path_for(cipher, &self.suffix).unwrap_or_else(|| cipher.to_path_buf());
        StoreKind::infer(&plain, &self.table)
    }
}

fn extension_of_cipher(cipher: &Path, suffix: &str) -> String {
    let plain = plain_path_for(cipher, suffix).unwrap_or_else(|| cipher.to_path_buf());
    StoreKind::extension_for(&plain)
}

/// Schema errors on a temporary copy are reported against its ciphertext.
fn attribute_to(err: SyncError, cipher: &Path) -> SyncError {
    match err {
        SyncError::SchemaMismatch { reason, .. } => SyncError::SchemaMismatch {
            path: cipher.to_path_buf(),
            reason,
        },
        other => other,
    }
}

/// Remove the temporary copies and fold any cleanup failure into the
/// outcome: appended to the report on success, logged only on error.
fn settle(
    outcome: Result<ReconReport>,
    temps: [TemporaryArtifact; 2],
) -> Result<ReconReport> {
    let cleanup: Vec<String> = temps
        .into_iter()
        .filter_map(TemporaryArtifact::release)
        .collect();
    for w in &cleanup {
        warn!("{w}");
    }
    outcome.map(|mut report| {
        report.warnings.extend(cleanup);
        report
    })
}

/// The error names `cipher`, since the temporary copy is gone by the time
/// the caller sees it.
fn ensure_not_empty(temp: &Path, cipher: &Path) -> Result<()> {
    match fs::metadata(temp) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(SyncError::EmptyDecryptedArtifact(cipher.to_path_buf())),
    }
}

fn build_report(
    left: &RecordSet,
    right: &RecordSet,
    fields: &BTreeSet<String>,
    left_label: &str,
    right_label: &str,
) -> Result<ReconReport> {
    let diff = left
        .difference(right, fields)
        .map_err(|e| relabel(e, left, right, left_label, right_label))?;

    // Report compared fields in the left store's column order.
    let compared_fields = left
        .fields()
        .iter()
        .filter(|f| fields.contains(*f))
        .cloned()
        .collect();

    Ok(ReconReport {
        left: left_label.to_string(),
        right: right_label.to_string(),
        compared_fields,
        unmatched_left_fields: left.fields_missing_from(right),
        unmatched_right_fields: right.fields_missing_from(left),
        left_rows: left.len(),
        right_rows: right.len(),
        only_in_left: diff.only_in_self,
        only_in_right: diff.only_in_other,
        warnings: Vec::new(),
        generated_at: Utc::now(),
    })
}

fn relabel(
    err: SyncError,
    left: &RecordSet,
    right: &RecordSet,
    left_label: &str,
    right_label: &str,
) -> SyncError {
    match err {
        SyncError::NoComparableFields { .. } => SyncError::NoComparableFields {
            left: left_label.to_string(),
            right: right_label.to_string(),
        },
        SyncError::MissingColumns { store, columns } => {
            let store = if store == left.label() {
                left_label.to_string()
            } else if store == right.label() {
                right_label.to_string()
            } else {
                store
            };
            SyncError::MissingColumns { store, columns }
        }
        other => other,
    }
}

fn log_outcome(report: &ReconReport) {
    if report.is_consistent() {
        info!(
            left = %report.left,
            right = %report.right,
            rows = report.left_rows,
            fields = report.compared_fields.len(),
            "stores are consistent"
        );
    } else {
        info!(
            left = %report.left,
            right = %report.right,
            only_in_left = report.only_in_left.len(),
            only_in_right = report.only_in_right.len(),
            "stores differ"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use tempfile::tempdir;

    fn db(path: &Path, ddl_and_rows: &str) {
        Connection::open(path)
            .unwrap()
            .execute_batch(ddl_and_rows)
            .unwrap();
    }

    fn relational(path: &Path) -> StoreRef {
        StoreRef::new(
            path,
            StoreKind::Relational {
                table: "persone".into(),
            },
        )
    }

    #[test]
    fn direct_consistent_and_extra_columns_reported() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        db(&a, "CREATE TABLE persone (nome TEXT, email TEXT);
                INSERT INTO persone VALUES ('Mario', 'm@x.it');");
        db(&b, "CREATE TABLE persone (email TEXT, nome TEXT, telefono TEXT);
                INSERT INTO persone VALUES ('m@x.it', 'Mario', '333');");

        let report = Reconciler::new().compare(&relational(&a), &relational(&b)).unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.compared_fields, vec!["nome", "email"]);
        assert_eq!(report.unmatched_right_fields, vec!["telefono"]);
        assert!(report.unmatched_left_fields.is_empty());
    }

    #[test]
    fn direct_requires_left_columns_on_right() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        db(&a, "CREATE TABLE persone (nome TEXT, email TEXT, citta TEXT);");
        db(&b, "CREATE TABLE persone (nome TEXT);");

        match Reconciler::new().compare(&relational(&a), &relational(&b)) {
            Err(SyncError::MissingColumns { store, columns }) => {
                assert!(store.ends_with("b.db"));
                assert_eq!(columns, vec!["email", "citta"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn direct_reports_multiset_difference() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        db(&a, "CREATE TABLE persone (x TEXT);
                INSERT INTO persone VALUES ('1'), ('1'), ('2');");
        db(&b, "CREATE TABLE persone (x TEXT);
                INSERT INTO persone VALUES ('1'), ('3');");

        let report = Reconciler::new().compare(&relational(&a), &relational(&b)).unwrap();
        assert!(!report.is_consistent());
        let left: Vec<&str> = report.only_in_left.iter().map(|r| r["x"].as_str()).collect();
        let right: Vec<&str> = report.only_in_right.iter().map(|r| r["x"].as_str()).collect();
        assert_eq!(left, ["1", "2"]);
        assert_eq!(right, ["3"]);
    }

    #[test]
    fn direct_missing_store() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.db");
        db(&a, "CREATE TABLE persone (x TEXT);");
        let err = Reconciler::new()
            .compare(&relational(&a), &relational(&dir.path().join("nope.db")))
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceNotFound(_)));
    }

    #[test]
    fn encrypted_compare_uses_intersection_and_cleans_up() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        db(&a, "CREATE TABLE persone (nome TEXT, citta TEXT);
                INSERT INTO persone VALUES ('Mario', 'Roma');");
        db(&b, "CREATE TABLE persone (nome TEXT, telefono TEXT);
                INSERT INTO persone VALUES ('Mario', '333'), ('Anna', '444');");

        let key = dir.path().join("key.key");
        let cs = CipherStore::new(&key);
        let ca = cs.encrypt(&a).unwrap();
        let cb = cs.encrypt(&b).unwrap();

        let report = Reconciler::new()
            .with_scratch_dir(&scratch)
            .compare_encrypted(&ca, &cb, &key)
            .unwrap();
        assert_eq!(report.compared_fields, vec!["nome"]);
        assert_eq!(report.unmatched_left_fields, vec!["citta"]);
        assert_eq!(report.unmatched_right_fields, vec!["telefono"]);
        assert_eq!(report.only_in_right.len(), 1);
        assert_eq!(report.only_in_right[0]["nome"], "Anna");
        assert!(report.warnings.is_empty());
        assert_eq!(report.left, ca.display().to_string());
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn encrypted_compare_disjoint_fields() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        db(&a, "CREATE TABLE persone (nome TEXT);");
        db(&b, "CREATE TABLE persone (codice TEXT);");
        let key = dir.path().join("key.key");
        let cs = CipherStore::new(&key);
        let ca = cs.encrypt(&a).unwrap();
        let cb = cs.encrypt(&b).unwrap();

        match Reconciler::new().with_scratch_dir(&scratch).compare_encrypted(&ca, &cb, &key) {
            Err(SyncError::NoComparableFields { left, right }) => {
                assert_eq!(left, ca.display().to_string());
                assert_eq!(right, cb.display().to_string());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn encrypted_compare_rejects_empty_plaintext() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        db(&a, "CREATE TABLE persone (nome TEXT);");
        fs::write(&b, b"").unwrap();
        let key = dir.path().join("key.key");
        let cs = CipherStore::new(&key);
        let ca = cs.encrypt(&a).unwrap();
        let cb = cs.encrypt(&b).unwrap();

        let err = Reconciler::new()
            .with_scratch_dir(&scratch)
            .compare_encrypted(&ca, &cb, &key)
            .unwrap_err();
        match err {
            SyncError::EmptyDecryptedArtifact(path) => assert_eq!(path, cb),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn unknown_store_type_in_cipher_name() {
        let dir = tempdir().unwrap();
        let key = dir.path().join("key.key");
        let plain = dir.path().join("notes.txt");
        fs::write(&plain, b"hello").unwrap();
        let cipher = CipherStore::new(&key).encrypt(&plain).unwrap();
        let err = Reconciler::new()
            .with_scratch_dir(dir.path())
            .compare_encrypted(&cipher, &cipher, &key)
            .unwrap_err();
        assert!(matches!(err, SyncError::SchemaMismatch { .. }));
    }

    fn empty_report() -> ReconReport {
        ReconReport {
            left: "a".into(),
            right: "b".into(),
            compared_fields: vec!["x".into()],
            unmatched_left_fields: vec![],
            unmatched_right_fields: vec![],
            left_rows: 0,
            right_rows: 0,
            only_in_left: vec![],
            only_in_right: vec![],
            warnings: vec![],
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn cleanup_failure_becomes_report_warning() {
        let dir = tempdir().unwrap();
        let stuck = TemporaryArtifact::allocate(dir.path(), "left", "db");
        // A directory at the temporary path cannot be removed as a file.
        fs::create_dir(stuck.path()).unwrap();
        let stuck_name = stuck.path().display().to_string();
        let clean = TemporaryArtifact::allocate(dir.path(), "right", "db");
        fs::write(clean.path(), b"rows").unwrap();
        let clean_path = clean.path().to_path_buf();

        let report = settle(Ok(empty_report()), [stuck, clean]).unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains(&stuck_name));
        assert!(!clean_path.exists());
    }

    #[test]
    fn cleanup_failure_never_replaces_the_error() {
        let dir = tempdir().unwrap();
        let stuck = TemporaryArtifact::allocate(dir.path(), "left", "db");
        fs::create_dir(stuck.path()).unwrap();
        let other = TemporaryArtifact::allocate(dir.path(), "right", "db");

        let err = settle(
            Err(SyncError::EmptyDecryptedArtifact("b.db.enc".into())),
            [stuck, other],
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::EmptyDecryptedArtifact(_)));
    }

    #[test]
    fn settings_drive_table_and_scratch() {
        let settings = SyncSettings {
            table: "clienti".into(),
            scratch_dir: Some("/var/tmp/dualstore".into()),
            ..SyncSettings::default()
        };
        let r = Reconciler::from_settings(&settings);
        assert_eq!(r.table, "clienti");
        assert_eq!(r.scratch_dir, Path::new("/var/tmp/dualstore"));
    }
}
