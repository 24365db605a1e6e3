//! Meter readings and batches of them.
//!
//! A [`Record`] is an ordered map of named text fields. Stages may add
//! or replace fields, so a record carries no fixed schema; a [`Batch`]
//! derives its column list from the union of its records' fields in
//! first-seen order. That is also the column order of the tabular
//! encoding used on the wire and in checkpoint artifacts.

use std::fmt;
use std::ops::Range;

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde::Deserialize;
use serde::Serialize;

/// One meter reading.
///
/// Identity is positional within its owning [`Batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record(IndexMap<String, String>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Add or replace a field.
    ///
    /// Replacing keeps the field's original position.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Record
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Stable identity of a batch across processes.
///
/// Derived from the tabular encoding of the batch as it was received,
/// so two units handed the same share agree on its identity without
/// coordinating.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(u64);

impl BatchId {
    pub fn from_payload(payload: &[u8]) -> Self {
        Self(seahash::hash(payload))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(Self)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// An ordered sequence of records from one dataset snapshot.
///
/// Order is preserved across slicing and concatenation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// Columns known before any record was seen, e.g. from a header
    /// row. Kept so a batch whose records were all rejected still
    /// encodes with a header.
    columns: Vec<String>,
    records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            columns: Vec::new(),
            records,
        }
    }

    pub(crate) fn with_columns(columns: Vec<String>, records: Vec<Record>) -> Self {
        Self { columns, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Union of the declared columns and every record's fields, in
    /// first-seen order.
    pub fn columns(&self) -> Vec<String> {
        let mut columns: IndexSet<&str> = self.columns.iter().map(String::as_str).collect();
        for record in &self.records {
            for (field, _) in record.fields() {
                columns.insert(field);
            }
        }
        columns.into_iter().map(str::to_owned).collect()
    }

    /// A copy of the records at the given positions.
    pub fn slice(&self, range: Range<usize>) -> Batch {
        Batch::with_columns(self.columns.clone(), self.records[range].to_vec())
    }

    /// Append `other`'s records after this batch's records.
    pub fn concat(mut self, other: Batch) -> Batch {
        for column in other.columns {
            if !self.columns.contains(&column) {
                self.columns.push(column);
            }
        }
        self.records.extend(other.records);
        self
    }

    /// Replace the records, keeping the declared columns.
    pub(crate) fn replace_records(&self, records: Vec<Record>) -> Batch {
        Batch::with_columns(self.columns.clone(), records)
    }

    /// Reorder records in place.
    ///
    /// Only done when explicitly asked for; every other operation is
    /// order preserving.
    pub fn shuffle(&mut self, rng: &mut fastrand::Rng) {
        rng.shuffle(&mut self.records);
    }

    /// Encode as comma separated UTF-8 text: a header row, then one
    /// row per record. Missing fields encode as empty cells.
    pub fn to_csv(&self) -> crate::errors::Result<Vec<u8>> {
        let columns = self.columns();
        if columns.is_empty() {
            return Ok(Vec::new());
        }
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        writer.write_record(&columns)?;
        for record in &self.records {
            writer.write_record(columns.iter().map(|c| record.get(c).unwrap_or("")))?;
        }
        writer
            .into_inner()
            .map_err(|err| crate::errors::Error::Io(err.into_error()))
    }

    /// Decode the encoding produced by [`Batch::to_csv`].
    ///
    /// Rows with a different number of cells than the header are an
    /// error, as is invalid UTF-8.
    pub fn from_csv(payload: &[u8]) -> Result<Batch, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(payload);
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_owned).collect();
        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            records.push(
                columns
                    .iter()
                    .zip(row.iter())
                    .map(|(c, v)| (c.clone(), v.to_owned()))
                    .collect(),
            );
        }
        Ok(Batch::with_columns(columns, records))
    }
}

impl From<Vec<Record>> for Batch {
    fn from(records: Vec<Record>) -> Self {
        Batch::new(records)
    }
}

#[cfg(test)]
pub(crate) fn reading(meter: &str, consumption: &str) -> Record {
    Record::from_iter([
        ("compteur_id", meter),
        ("timestamp", "2024-05-01 08:00:00"),
        ("consommation", consumption),
        ("type_client", "Residentiel"),
        ("wilaya", "Alger"),
        ("ville", "Bab Ezzouar"),
        ("localisation", "36.7268,3.1829"),
        ("region", "Nord"),
        ("code_postal", "16024"),
        ("fournisseur", "Sonelgaz"),
        ("tarif", "0.12"),
        ("puissance_souscrite", "6 kW"),
        ("type_compteur", "Smart Meter Gen 2"),
    ])
}

#[test]
fn csv_quotes_fields_with_commas() {
    let batch = Batch::new(vec![reading("123456", "12.5 kWh")]);
    let text = String::from_utf8(batch.to_csv().unwrap()).unwrap();
    assert!(text.contains("\"36.7268,3.1829\""), "got: {text}");

    let decoded = Batch::from_csv(text.as_bytes()).unwrap();
    assert_eq!(decoded.records(), batch.records());
}

#[test]
fn columns_are_union_in_first_seen_order() {
    let mut second = Record::from_iter([("b", "2"), ("c", "3")]);
    second.set("a", "1");
    let batch = Batch::new(vec![Record::from_iter([("a", "x"), ("b", "y")]), second]);
    assert_eq!(batch.columns(), vec!["a", "b", "c"]);

    let text = String::from_utf8(batch.to_csv().unwrap()).unwrap();
    assert_eq!(text, "a,b,c\nx,y,\n1,2,3\n");
}

#[test]
fn empty_batch_keeps_header() {
    let batch = Batch::with_columns(vec!["a".into(), "b".into()], Vec::new());
    let text = batch.to_csv().unwrap();
    assert_eq!(text, b"a,b\n");

    let decoded = Batch::from_csv(&text).unwrap();
    assert!(decoded.is_empty());
    assert_eq!(decoded.columns(), vec!["a", "b"]);
}

#[test]
fn ragged_rows_are_rejected() {
    let err = Batch::from_csv(b"a,b,c\n1,2,3\n4,5\n").unwrap_err();
    assert!(matches!(err.kind(), csv::ErrorKind::UnequalLengths { .. }));
}

#[test]
fn batch_id_is_stable_and_round_trips_hex() {
    let a = BatchId::from_payload(b"a,b\n1,2\n");
    let b = BatchId::from_payload(b"a,b\n1,2\n");
    assert_eq!(a, b);
    assert_ne!(a, BatchId::from_payload(b"a,b\n1,3\n"));
    assert_eq!(BatchId::from_hex(&a.to_string()), Some(a));
    assert_eq!(BatchId::from_hex("not-hex"), None);
}

#[test]
fn slice_and_concat_preserve_order() {
    let batch = Batch::new(
        (0..5)
            .map(|i| Record::from_iter([("n", i.to_string())]))
            .collect(),
    );
    let joined = batch.slice(0..2).concat(batch.slice(2..5));
    assert_eq!(joined, batch);
}
