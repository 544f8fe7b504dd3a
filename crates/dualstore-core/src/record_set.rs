//! Schema-normalized, in-memory view of a store's rows.
//!
//! Field names are trimmed and lower-cased on load; values are trimmed but
//! keep their case. Two sets are compared only over fields both of them have.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::sources::{RawTable, RecordSource, StoreKind};

/// One row: normalized field name to text value.
pub type Record = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSet {
    label: String,
    fields: Vec<String>,
    records: Vec<Record>,
}

/// Rows left unmatched on each side after multiset subtraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Difference {
    pub only_in_self: Vec<Record>,
    pub only_in_other: Vec<Record>,
}

impl Difference {
    pub fn is_empty(&self) -> bool {
        self.only_in_self.is_empty() && self.only_in_other.is_empty()
    }
}

pub fn normalize_field(name: &str) -> String {
    name.trim().to_lowercase()
}

fn normalize_value(value: &str) -> String {
    value.trim().to_string()
}

impl RecordSet {
    /// Load every row of the store at `path`.
    pub fn load(path: &Path, kind: &StoreKind) -> Result<Self> {
        if !path.exists() {
            return Err(SyncError::SourceNotFound(path.to_path_buf()));
        }
        Self::from_source(&*kind.open(path))
    }

    pub fn from_source(source: &dyn RecordSource) -> Result<Self> {
        let raw = source.read_all()?;
        Self::from_raw(source.location(), raw)
    }

    pub fn from_raw(location: &Path, raw: RawTable) -> Result<Self> {
        let mut fields = Vec::with_capacity(raw.columns.len());
        for (idx, column) in raw.columns.iter().enumerate() {
            let name = normalize_field(column);
            if name.is_empty() {
                return Err(SyncError::schema(
                    location,
                    format!("column {} has a blank header", idx + 1),
                ));
            }
            if fields.contains(&name) {
                return Err(SyncError::schema(
                    location,
                    format!("duplicate column `{name}`"),
                ));
            }
            fields.push(name);
        }

        let records: Vec<Record> = raw
            .rows
            .iter()
            .map(|row| {
                fields
                    .iter()
                    .enumerate()
                    .map(|(idx, field)| {
                        let value = row.get(idx).map(|v| normalize_value(v)).unwrap_or_default();
                        (field.clone(), value)
                    })
                    .collect::<Record>()
            })
            .collect();

        Ok(Self {
            label: location.display().to_string(),
            fields,
            records,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Field names in source column order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    pub fn common_fields(&self, other: &RecordSet) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|f| other.has_field(f))
            .cloned()
            .collect()
    }

    /// Fields this set has that `other` lacks, in this set's column order.
    pub fn fields_missing_from(&self, other: &RecordSet) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| !other.has_field(f))
            .cloned()
            .collect()
    }

    /// Duplicate-aware difference of the two sets restricted to `fields`.
    ///
    /// Rows are ordered by their field tuple (ties keep source order) before
    /// matching, so output is reproducible. A row appearing twice here and
    /// once in `other` is reported once in `only_in_self`.
    pub fn difference(&self, other: &RecordSet, fields: &BTreeSet<String>) -> Result<Difference> {
        if fields.is_empty() {
            return Err(SyncError::NoComparableFields {
                left: self.label.clone(),
                right: other.label.clone(),
            });
        }
        for set in [self, other] {
            let absent: Vec<String> = fields.iter().filter(|f| !set.has_field(f)).cloned().collect();
            if !absent.is_empty() {
                return Err(SyncError::MissingColumns {
                    store: set.label.clone(),
                    columns: absent,
                });
            }
        }

        let ours = self.sorted_projection(fields);
        let theirs = other.sorted_projection(fields);

        Ok(Difference {
            only_in_self: subtract(&ours, &theirs, fields),
            only_in_other: subtract(&theirs, &ours, fields),
        })
    }

    fn sorted_projection(&self, fields: &BTreeSet<String>) -> Vec<Vec<String>> {
        let mut rows: Vec<(Vec<String>, usize)> = self
            .records
            .iter()
            .enumerate()
            .map(|(idx, record)| {
                let tuple = fields
                    .iter()
                    .map(|f| record.get(f).cloned().unwrap_or_default())
                    .collect();
                (tuple, idx)
            })
            .collect();
        rows.sort();
        rows.into_iter().map(|(tuple, _)| tuple).collect()
    }
}

fn subtract(
    left: &[Vec<String>],
    right: &[Vec<String>],
    fields: &BTreeSet<String>,
) -> Vec<Record> {
    let mut remaining: HashMap<&[String], usize> = HashMap::new();
    for tuple in right {
        *remaining.entry(tuple.as_slice()).or_default() += 1;
    }

    let mut unmatched: Vec<Record> = Vec::new();
    for tuple in left {
        match remaining.get_mut(tuple.as_slice()) {
            Some(count) if *count > 0 => *count -= 1,
            _ => unmatched.push(fields.iter().cloned().zip(tuple.iter().cloned()).collect()),
        }
    }
    unmatched
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(label: &str, columns: &[&str], rows: &[&[&str]]) -> RecordSet {
        let raw = RawTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| v.to_string()).collect())
                .collect(),
        };
        RecordSet::from_raw(Path::new(label), raw).unwrap()
    }

    fn rec(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn field_names_are_normalized_on_load() {
        let s = set("a", &[" Nome ", "EMAIL"], &[&["Mario", " m@x.it "]]);
        assert_eq!(s.fields(), ["nome", "email"]);
        assert_eq!(s.records()[0], rec(&[("nome", "Mario"), ("email", "m@x.it")]));
    }

    #[test]
    fn short_rows_are_padded() {
        let s = set("a", &["nome", "email"], &[&["Mario"]]);
        assert_eq!(s.records()[0], rec(&[("nome", "Mario"), ("email", "")]));
    }

    #[test]
    fn duplicate_normalized_header_is_rejected() {
        let raw = RawTable {
            columns: vec!["Nome".into(), "nome ".into()],
            rows: vec![],
        };
        assert!(matches!(
            RecordSet::from_raw(Path::new("a"), raw),
            Err(SyncError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn blank_header_is_rejected() {
        let raw = RawTable {
            columns: vec!["nome".into(), "  ".into()],
            rows: vec![],
        };
        let err = RecordSet::from_raw(Path::new("a"), raw).unwrap_err();
        assert!(err.to_string().contains("column 2"));
    }

    #[test]
    fn multiset_difference() {
        let a = set("a", &["x"], &[&["1"], &["1"], &["2"]]);
        let b = set("b", &["x"], &[&["1"], &["3"]]);
        let fields = a.common_fields(&b);

        let diff = a.difference(&b, &fields).unwrap();
        assert_eq!(diff.only_in_self, vec![rec(&[("x", "1")]), rec(&[("x", "2")])]);
        assert_eq!(diff.only_in_other, vec![rec(&[("x", "3")])]);
    }

    #[test]
    fn equal_multisets_in_any_order() {
        let a = set("a", &["x", "y"], &[&["2", "b"], &["1", "a"], &["1", "a"]]);
        let b = set("b", &["y", "x"], &[&["a", "1"], &["b", "2"], &["a", "1"]]);
        let diff = a.difference(&b, &a.common_fields(&b)).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn output_is_sorted_by_field_tuple() {
        let a = set("a", &["x"], &[&["c"], &["a"], &["b"]]);
        let b = set("b", &["x"], &[]);
        let diff = a.difference(&b, &a.common_fields(&b)).unwrap();
        let xs: Vec<&str> = diff.only_in_self.iter().map(|r| r["x"].as_str()).collect();
        assert_eq!(xs, ["a", "b", "c"]);
    }

    #[test]
    fn values_compare_as_text_without_coercion() {
        let a = set("a", &["eta"], &[&["40"]]);
        let b = set("b", &["eta"], &[&["40.0"]]);
        let diff = a.difference(&b, &a.common_fields(&b)).unwrap();
        assert_eq!(diff.only_in_self.len(), 1);
        assert_eq!(diff.only_in_other.len(), 1);
    }

    #[test]
    fn comparison_restricted_to_shared_fields() {
        let a = set("a", &["nome", "email"], &[&["Mario", "m@x.it"]]);
        let b = set(
            "b",
            &["nome", "email", "telefono"],
            &[&["Mario", "m@x.it", "333"]],
        );
        let fields = a.common_fields(&b);
        assert_eq!(fields.iter().collect::<Vec<_>>(), ["email", "nome"]);
        assert!(a.difference(&b, &fields).unwrap().is_empty());
        assert_eq!(b.fields_missing_from(&a), vec!["telefono".to_string()]);
    }

    #[test]
    fn disjoint_fields_are_not_comparable() {
        let a = set("a", &["nome"], &[&["Mario"]]);
        let b = set("b", &["codice"], &[&["X1"]]);
        let fields = a.common_fields(&b);
        assert!(matches!(
            a.difference(&b, &fields),
            Err(SyncError::NoComparableFields { .. })
        ));
    }

    #[test]
    fn requesting_absent_field_names_it() {
        let a = set("a", &["nome", "email"], &[]);
        let b = set("b", &["nome"], &[]);
        let fields: BTreeSet<String> = ["nome", "email"].iter().map(|s| s.to_string()).collect();
        match a.difference(&b, &fields) {
            Err(SyncError::MissingColumns { store, columns }) => {
                assert_eq!(store, "b");
                assert_eq!(columns, vec!["email".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
