//! Record shape analysis: column kind inference and signature fingerprints.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::Record;

/// Records examined when inferring a signature unless configured otherwise.
pub const DEFAULT_SAMPLE_SIZE: usize = 100;

/// SHA-256 of the empty input, the fingerprint of a signature with no columns.
pub const EMPTY_SIGNATURE_FINGERPRINT: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Primitive storage kind inferred for a column.
///
/// `Integer`, `Real` and `Text` form a total order used for widening. `Json`
/// sits outside that order: any compound value forces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Json,
}

impl ColumnKind {
    /// Kind of a single value, or `None` for `null`.
    pub fn of(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => None,
            JsonValue::Bool(_) => Some(Self::Integer),
            // SQLite integers are signed 64-bit; anything wider is stored as REAL.
            JsonValue::Number(n) if n.is_i64() => Some(Self::Integer),
            JsonValue::Number(_) => Some(Self::Real),
            JsonValue::String(_) => Some(Self::Text),
            JsonValue::Array(_) | JsonValue::Object(_) => Some(Self::Json),
        }
    }

    pub fn widen(self, other: Self) -> Self {
        if self == Self::Json || other == Self::Json {
            Self::Json
        } else {
            self.max(other)
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text | Self::Json => "TEXT",
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Integer => 1,
            Self::Real => 2,
            Self::Text => 3,
            Self::Json => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column name to inferred kind, ordered by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaSignature {
    columns: BTreeMap<String, ColumnKind>,
}

impl SchemaSignature {
    /// Infer a signature from at most `sample_limit` leading records.
    ///
    /// Columns only ever seen as `null` resolve to `Text`. A column missing from
    /// later records keeps the kind already observed.
    pub fn infer(batch: &[Record], sample_limit: usize) -> Self {
        let mut observed: BTreeMap<String, Option<ColumnKind>> = BTreeMap::new();
        for record in batch.iter().take(sample_limit) {
            for (column, value) in record {
                let slot = observed.entry(column.clone()).or_insert(None);
                if let Some(kind) = ColumnKind::of(value) {
                    *slot = Some(match *slot {
                        Some(seen) => seen.widen(kind),
                        None => kind,
                    });
                }
            }
        }

        let columns = observed
            .into_iter()
            .map(|(column, kind)| (column, kind.unwrap_or(ColumnKind::Text)))
            .collect();
        Self { columns }
    }

    pub fn from_columns<I, K>(columns: I) -> Self
    where
        I: IntoIterator<Item = (K, ColumnKind)>,
        K: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn get(&self, column: &str) -> Option<ColumnKind> {
        self.columns.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ColumnKind)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Columns of `other` missing here are added; existing kinds win.
    pub fn extend_missing(&mut self, other: &SchemaSignature) {
        for (column, kind) in &other.columns {
            self.columns.entry(column.clone()).or_insert(*kind);
        }
    }

    /// Hex SHA-256 over the sorted columns, each encoded as the name's byte
    /// length (u64 LE), the name, then the kind. Names are arbitrary producer
    /// keys, so no separator character can be trusted.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (column, kind) in &self.columns {
            hasher.update((column.len() as u64).to_le_bytes());
            hasher.update(column.as_bytes());
            hasher.update([kind.tag()]);
        }
        hex::encode(hasher.finalize())
    }

    /// `{column: SQL type}` as stored in the schema ledger.
    pub fn column_definitions(&self) -> BTreeMap<String, &'static str> {
        self.columns
            .iter()
            .map(|(column, kind)| (column.clone(), kind.sql_type()))
            .collect()
    }

    /// Changes needed to go from `self` (stored) to `incoming`.
    pub fn diff(&self, incoming: &SchemaSignature) -> SignatureDelta {
        let mut delta = SignatureDelta::default();
        for (column, kind) in &incoming.columns {
            match self.columns.get(column) {
                None => {
                    delta.added.insert(column.clone(), *kind);
                }
                Some(stored) if stored != kind => delta.retyped.push(RetypedColumn {
                    column: column.clone(),
                    from: *stored,
                    to: *kind,
                }),
                Some(_) => {}
            }
        }
        delta.removed = self
            .columns
            .keys()
            .filter(|column| !incoming.columns.contains_key(*column))
            .cloned()
            .collect();
        delta
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetypedColumn {
    pub column: String,
    pub from: ColumnKind,
    pub to: ColumnKind,
}

/// Column-level difference between a stored and an incoming signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureDelta {
    pub added: BTreeMap<String, ColumnKind>,
    pub removed: Vec<String>,
    pub retyped: Vec<RetypedColumn>,
}

impl SignatureDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.retyped.is_empty()
    }

    /// True when the only change is new columns.
    pub fn is_additive(&self) -> bool {
        self.removed.is_empty() && self.retyped.is_empty()
    }
}

impl fmt::Display for SignatureDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no column changes");
        }
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            let added = self
                .added
                .iter()
                .map(|(column, kind)| format!("{column} ({kind})"))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("added: {added}"));
        }
        if !self.removed.is_empty() {
            parts.push(format!("removed: {}", self.removed.join(", ")));
        }
        if !self.retyped.is_empty() {
            let retyped = self
                .retyped
                .iter()
                .map(|r| format!("{} ({} -> {})", r.column, r.from, r.to))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("retyped: {retyped}"));
        }
        f.write_str(&parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use serde_json::json;

    #[test]
    fn empty_fingerprint_is_sha256_of_nothing() {
        let hash = hex::encode(Sha256::digest(b""));
        assert_eq!(hash, EMPTY_SIGNATURE_FINGERPRINT);
        assert_eq!(SchemaSignature::infer(&[], DEFAULT_SAMPLE_SIZE).fingerprint(), hash);
    }

    #[test]
    fn empty_fingerprint_differs_from_any_column() {
        let sig = SchemaSignature::infer(&[record([("id", json!(1))])], DEFAULT_SAMPLE_SIZE);
        assert_ne!(sig.fingerprint(), EMPTY_SIGNATURE_FINGERPRINT);
    }

    #[test]
    fn unsigned_values_past_i64_are_real() {
        assert_eq!(ColumnKind::of(&json!(i64::MAX)), Some(ColumnKind::Integer));
        assert_eq!(ColumnKind::of(&json!(i64::MAX as u64 + 1)), Some(ColumnKind::Real));
        assert_eq!(ColumnKind::of(&json!(u64::MAX)), Some(ColumnKind::Real));
    }

    #[test]
    fn separators_in_column_names_cannot_forge_a_fingerprint() {
        let plain = SchemaSignature::from_columns([
            ("x", ColumnKind::Integer),
            ("y", ColumnKind::Text),
        ]);
        let forged = SchemaSignature::from_columns([("x:integer\ny", ColumnKind::Text)]);
        assert_ne!(plain.fingerprint(), forged.fingerprint());

        let split = SchemaSignature::from_columns([("ab", ColumnKind::Text)]);
        let joined = SchemaSignature::from_columns([("a", ColumnKind::Text), ("b", ColumnKind::Text)]);
        assert_ne!(split.fingerprint(), joined.fingerprint());
    }

    #[test]
    fn widening_follows_integer_real_text() {
        let batch = vec![
            record([("price", json!(20)), ("code", json!(7))]),
            record([("price", json!(19.99)), ("code", json!("X7"))]),
        ];
        let sig = SchemaSignature::infer(&batch, DEFAULT_SAMPLE_SIZE);
        assert_eq!(sig.get("price"), Some(ColumnKind::Real));
        assert_eq!(sig.get("code"), Some(ColumnKind::Text));
    }

    #[test]
    fn compound_values_force_json_regardless_of_order() {
        let batch = vec![
            record([("meta", json!("plain")), ("tags", json!(["a"]))]),
            record([("meta", json!({"k": 1})), ("tags", json!(3))]),
        ];
        let sig = SchemaSignature::infer(&batch, DEFAULT_SAMPLE_SIZE);
        assert_eq!(sig.get("meta"), Some(ColumnKind::Json));
        assert_eq!(sig.get("tags"), Some(ColumnKind::Json));
    }

    #[test]
    fn missing_and_null_values_do_not_narrow() {
        let batch = vec![
            record([("a", json!(1.5)), ("b", json!(null))]),
            record([("b", json!(null))]),
            record([("a", json!(null))]),
        ];
        let sig = SchemaSignature::infer(&batch, DEFAULT_SAMPLE_SIZE);
        assert_eq!(sig.get("a"), Some(ColumnKind::Real));
        assert_eq!(sig.get("b"), Some(ColumnKind::Text));
    }

    #[test]
    fn sample_limit_bounds_the_scan() {
        let batch = vec![record([("n", json!(1))]), record([("n", json!("late"))])];
        let sig = SchemaSignature::infer(&batch, 1);
        assert_eq!(sig.get("n"), Some(ColumnKind::Integer));
    }

    #[test]
    fn fingerprint_ignores_record_and_key_order() {
        let a = vec![
            record([("id", json!(1)), ("name", json!("x"))]),
            record([("name", json!("y")), ("id", json!(2)), ("score", json!(0.5))]),
        ];
        let b = vec![
            record([("score", json!(1.25)), ("id", json!(9)), ("name", json!("z"))]),
            record([("id", json!(3)), ("name", json!("w"))]),
        ];
        assert_eq!(
            SchemaSignature::infer(&a, DEFAULT_SAMPLE_SIZE).fingerprint(),
            SchemaSignature::infer(&b, DEFAULT_SAMPLE_SIZE).fingerprint()
        );
    }

    #[test]
    fn diff_reports_added_removed_and_retyped() {
        let stored = SchemaSignature::from_columns([
            ("id", ColumnKind::Integer),
            ("price", ColumnKind::Integer),
            ("legacy", ColumnKind::Text),
        ]);
        let incoming = SchemaSignature::from_columns([
            ("id", ColumnKind::Integer),
            ("price", ColumnKind::Real),
            ("currency", ColumnKind::Text),
        ]);
        let delta = stored.diff(&incoming);
        assert_eq!(delta.added.get("currency"), Some(&ColumnKind::Text));
        assert_eq!(delta.removed, vec!["legacy".to_string()]);
        assert_eq!(
            delta.retyped,
            vec![RetypedColumn {
                column: "price".into(),
                from: ColumnKind::Integer,
                to: ColumnKind::Real,
            }]
        );
        assert!(!delta.is_additive());
        assert_eq!(
            delta.to_string(),
            "added: currency (text); removed: legacy; retyped: price (integer -> real)"
        );
    }

    #[test]
    fn column_definitions_use_sql_types() {
        let sig = SchemaSignature::from_columns([("doc", ColumnKind::Json), ("n", ColumnKind::Real)]);
        let defs = sig.column_definitions();
        assert_eq!(defs.get("doc"), Some(&"TEXT"));
        assert_eq!(defs.get("n"), Some(&"REAL"));
    }
}
