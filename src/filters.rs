//! Meter-reading validation, normalization and transformation.
//!
//! These are the three per-record capabilities [`crate::pipeline`]
//! runs. The field names are the ones the meter fleet emits.
//!
//! Validation reports every problem it finds rather than stopping at
//! the first, and never panics on missing or unparsable fields.
//! Normalization and transformation assume the record passed
//! validation, but still leave a field untouched rather than panic if
//! it can't be parsed.

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use regex::Regex;

use crate::errors::Error;
use crate::errors::Result;
use crate::pipeline::RecordFilter;
use crate::pipeline::Validator;
use crate::pipeline::Verdict;
use crate::record::Record;

pub mod fields {
    pub const METER_ID: &str = "compteur_id";
    pub const TIMESTAMP: &str = "timestamp";
    pub const CONSUMPTION: &str = "consommation";
    pub const CLIENT_TYPE: &str = "type_client";
    pub const WILAYA: &str = "wilaya";
    pub const CITY: &str = "ville";
    pub const LOCATION: &str = "localisation";
    pub const REGION: &str = "region";
    pub const POSTAL_CODE: &str = "code_postal";
    pub const SUPPLIER: &str = "fournisseur";
    pub const TARIFF: &str = "tarif";
    pub const SUBSCRIBED_POWER: &str = "puissance_souscrite";
    pub const METER_TYPE: &str = "type_compteur";

    // Added by the transformation stage.
    pub const CONSUMPTION_8H: &str = "consommation_8h";
    pub const CLIENT_CATEGORY: &str = "categorie_client";
    pub const CONSUMPTION_RATIO: &str = "ratio_consommation";
}

use fields::*;

const CLIENT_TYPES: [&str; 3] = ["residentiel", "commercial", "industriel"];

const MAX_CONSUMPTION: f64 = 10_000.0;

/// Fields longer than this are flagged as anomalies.
const MAX_FIELD_BYTES: usize = 256;

/// Readings arrive every 8 hours.
const HOURS_PER_READING: f64 = 8.0;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| Error::config(format!("bad pattern {pattern:?}: {err}")))
}

/// Split `"<number> <unit>"` into its parts. The unit is optional.
fn quantity(value: &str) -> Option<(f64, Option<&str>)> {
    let mut parts = value.split_whitespace();
    let number = parts.next()?.parse::<f64>().ok()?;
    let unit = parts.next();
    if parts.next().is_some() || !number.is_finite() {
        return None;
    }
    Some((number, unit))
}

/// Shortest text that parses back to the same number, always with a
/// fractional part.
fn number_text(value: f64) -> String {
    format!("{value:?}")
}

fn required<'r>(record: &'r Record, name: &str, errors: &mut Vec<String>) -> Option<&'r str> {
    match record.get(name) {
        Some(value) if !value.is_empty() => Some(value),
        _ => {
            errors.push(format!("missing {name}"));
            None
        }
    }
}

/// Missing fields were already reported by [`required`].
fn check(errors: &mut Vec<String>, value: Option<&str>, ok: impl Fn(&str) -> bool, msg: &str) {
    if let Some(value) = value {
        if !ok(value) {
            errors.push(msg.to_string());
        }
    }
}

fn is_consumption(value: &str) -> bool {
    match quantity(value) {
        Some((n, Some(unit))) => {
            (0.0..=MAX_CONSUMPTION).contains(&n)
                && (unit.eq_ignore_ascii_case("wh") || unit.eq_ignore_ascii_case("kwh"))
        }
        _ => false,
    }
}

fn is_timestamp(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || TIMESTAMP_FORMATS
            .iter()
            .any(|fmt| NaiveDateTime::parse_from_str(value, fmt).is_ok())
        || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

fn is_alphabetic(value: &str) -> bool {
    !value.is_empty() && value.chars().all(char::is_alphabetic)
}

fn is_alphanumeric_words(value: &str) -> bool {
    !value.trim().is_empty() && value.chars().all(|c| c.is_alphanumeric() || c.is_whitespace())
}

fn is_city_name(value: &str) -> bool {
    !value.trim().is_empty()
        && value
            .chars()
            .all(|c| c.is_alphabetic() || c.is_whitespace() || matches!(c, '"' | '\'' | '’'))
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Checks a meter reading field by field.
pub struct MeterValidator {
    meter_id: Regex,
    location: Regex,
    postal_code: Regex,
    markup: Regex,
    sql: Regex,
}

impl MeterValidator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            meter_id: compile(r"^\d{6}$")?,
            location: compile(r"^-?\d+\.\d+,-?\d+\.\d+$")?,
            postal_code: compile(r"^\d{5}$")?,
            markup: compile(r"(?i)<\s*/?\s*(script|iframe|object|embed|svg|img)\b|javascript:|\bon[a-z]+\s*=")?,
            sql: compile(
                r"(?i)(--|/\*|;\s*(drop|delete|insert|update|alter|select)\b|\bunion\s+(all\s+)?select\b|'\s*or\s+'?\d+'?\s*=\s*'?\d+)",
            )?,
        })
    }

    fn check_errors(&self, record: &Record, errors: &mut Vec<String>) {
        let meter_id = required(record, METER_ID, errors);
        let timestamp = required(record, TIMESTAMP, errors);
        let consumption = required(record, CONSUMPTION, errors);
        let client_type = required(record, CLIENT_TYPE, errors);
        let wilaya = required(record, WILAYA, errors);
        let city = required(record, CITY, errors);
        let location = required(record, LOCATION, errors);
        let region = required(record, REGION, errors);
        let postal_code = required(record, POSTAL_CODE, errors);
        let supplier = required(record, SUPPLIER, errors);
        let tariff = required(record, TARIFF, errors);
        let power = required(record, SUBSCRIBED_POWER, errors);
        let meter_type = required(record, METER_TYPE, errors);

        check(errors, meter_id, |v| self.meter_id.is_match(v), "invalid meter id");
        check(errors, timestamp, is_timestamp, "invalid timestamp");
        check(errors, consumption, is_consumption, "invalid consumption");
        check(
            errors,
            client_type,
            |v| CLIENT_TYPES.contains(&v.to_lowercase().as_str()),
            "invalid client type",
        );
        check(errors, wilaya, is_alphabetic, "invalid wilaya");
        check(errors, city, is_city_name, "invalid city");
        check(errors, location, |v| self.location.is_match(v), "invalid location");
        check(errors, region, is_alphabetic, "invalid region");
        check(
            errors,
            postal_code,
            |v| self.postal_code.is_match(v),
            "invalid postal code",
        );
        check(errors, supplier, is_alphanumeric_words, "invalid supplier");
        check(
            errors,
            tariff,
            |v| matches!(v.trim().parse::<f64>(), Ok(t) if t.is_finite() && t > 0.0),
            "invalid tariff",
        );
        check(
            errors,
            power,
            |v| matches!(quantity(v), Some((p, _)) if p > 0.0),
            "invalid subscribed power",
        );
        check(errors, meter_type, is_alphanumeric_words, "invalid meter type");
    }

    fn check_anomalies(&self, record: &Record, anomalies: &mut Vec<String>) {
        for (name, value) in record.fields() {
            if value.len() > MAX_FIELD_BYTES {
                anomalies.push(format!("{name}: oversized value ({} bytes)", value.len()));
            }
            if value.chars().any(char::is_control) {
                anomalies.push(format!("{name}: control characters"));
            }
            if self.markup.is_match(value) {
                anomalies.push(format!("{name}: markup or script fragment"));
            }
            if self.sql.is_match(value) {
                anomalies.push(format!("{name}: SQL fragment"));
            }
        }
    }
}

impl Validator for MeterValidator {
    fn validate(&self, record: &Record) -> Verdict {
        let mut verdict = Verdict::default();
        self.check_errors(record, &mut verdict.errors);
        self.check_anomalies(record, &mut verdict.anomalies);
        verdict
    }
}

/// Brings units and spelling to one convention.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeterNormalizer;

impl RecordFilter for MeterNormalizer {
    fn apply(&self, mut record: Record) -> Record {
        let kwh = record
            .get(CONSUMPTION)
            .and_then(quantity)
            .map(|(value, unit)| match unit {
                Some(unit) if unit.eq_ignore_ascii_case("wh") => value / 1000.0,
                _ => value,
            });
        if let Some(kwh) = kwh {
            record.set(CONSUMPTION, format!("{kwh:.5} kWh"));
        }

        let rewrites: [(&str, fn(&str) -> Option<String>); 6] = [
            (CLIENT_TYPE, |v| Some(capitalize(v))),
            (WILAYA, |v| Some(v.to_uppercase())),
            (CITY, |v| Some(v.to_uppercase())),
            (SUPPLIER, |v| Some(v.replace(' ', "_").to_uppercase())),
            (SUBSCRIBED_POWER, |v| quantity(v).map(|(p, _)| number_text(p))),
            (POSTAL_CODE, |v| v.trim().parse::<u32>().ok().map(|c| c.to_string())),
        ];
        for (name, rewrite) in rewrites {
            if let Some(new) = record.get(name).and_then(rewrite) {
                record.set(name, new);
            }
        }
        if let Some(tariff) = record.get(TARIFF).and_then(|v| v.trim().parse::<f64>().ok()) {
            record.set(TARIFF, number_text(tariff));
        }
        record
    }
}

/// Adds fields derived from a normalized reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeterTransformer;

impl MeterTransformer {
    pub fn category(kwh: f64) -> &'static str {
        if kwh < 1.67 {
            "Faible consommation"
        } else if kwh < 6.67 {
            "Consommation moyenne"
        } else {
            "Forte consommation"
        }
    }
}

impl RecordFilter for MeterTransformer {
    fn apply(&self, mut record: Record) -> Record {
        let Some(kwh) = record.get(CONSUMPTION).and_then(quantity).map(|(v, _)| v) else {
            return record;
        };
        record.set(
            CONSUMPTION_8H,
            format!("{:.5} kWh", kwh * HOURS_PER_READING),
        );
        record.set(CLIENT_CATEGORY, Self::category(kwh));
        if let Some(power) = record
            .get(SUBSCRIBED_POWER)
            .and_then(quantity)
            .map(|(p, _)| p)
            .filter(|p| *p > 0.0)
        {
            record.set(CONSUMPTION_RATIO, number_text(kwh / power));
        }
        record
    }
}

#[cfg(test)]
use crate::record::reading;

#[test]
fn good_reading_passes() {
    let verdict = MeterValidator::new()
        .unwrap()
        .validate(&reading("123456", "3.2 kWh"));
    assert_eq!(verdict, Verdict::default());
}

#[test]
fn every_bad_field_is_reported() {
    let mut record = reading("12345", "20000 kWh");
    record.set(TIMESTAMP, "yesterday");
    record.set(CLIENT_TYPE, "agricole");
    record.set(LOCATION, "36.7,north");
    record.set(TARIFF, "-1");
    record.set(SUBSCRIBED_POWER, "0 kW");
    let verdict = MeterValidator::new().unwrap().validate(&record);
    assert_eq!(
        verdict.errors,
        vec![
            "invalid meter id",
            "invalid timestamp",
            "invalid consumption",
            "invalid client type",
            "invalid location",
            "invalid tariff",
            "invalid subscribed power",
        ]
    );
}

#[test]
fn missing_fields_are_errors_not_panics() {
    let record = Record::from_iter([(METER_ID, "123456")]);
    let verdict = MeterValidator::new().unwrap().validate(&record);
    assert!(verdict.errors.contains(&"missing consommation".to_string()));
    assert_eq!(verdict.errors.len(), 12);
}

#[test]
fn timestamps_accept_iso_variants() {
    assert!(is_timestamp("2024-05-01 08:00:00"));
    assert!(is_timestamp("2024-05-01T08:00:00.123"));
    assert!(is_timestamp("2024-05-01T08:00:00+01:00"));
    assert!(is_timestamp("2024-05-01"));
    assert!(!is_timestamp("2024-13-01"));
    assert!(!is_timestamp("01/05/2024"));
}

#[test]
fn suspicious_input_is_an_anomaly_not_an_error() {
    let mut record = reading("123456", "1 kWh");
    record.set(REGION, "Nord<script>alert(1)</script>");
    record.set(METER_TYPE, "Gen 2'; DROP TABLE readings; --");
    let verdict = MeterValidator::new().unwrap().validate(&record);
    assert!(verdict
        .anomalies
        .iter()
        .any(|a| a == "region: markup or script fragment"));
    assert!(verdict
        .anomalies
        .iter()
        .any(|a| a == "type_compteur: SQL fragment"));
    // The region is also not alphabetic, which is an error on its own.
    assert!(verdict.errors.contains(&"invalid region".to_string()));
}

#[test]
fn oversized_fields_are_flagged() {
    let mut record = reading("123456", "1 kWh");
    record.set(SUPPLIER, "A".repeat(300));
    let verdict = MeterValidator::new().unwrap().validate(&record);
    assert!(verdict.is_valid());
    assert_eq!(verdict.anomalies, vec!["fournisseur: oversized value (300 bytes)"]);
}

#[test]
fn normalizer_converts_units_and_spelling() {
    let mut record = reading("123456", "500 Wh");
    record.set(CLIENT_TYPE, "residentiel");
    record.set(CITY, "bab ezzouar");
    record.set(SUPPLIER, "Power Algeria");
    let out = MeterNormalizer.apply(record);
    assert_eq!(out.get(CONSUMPTION), Some("0.50000 kWh"));
    assert_eq!(out.get(CLIENT_TYPE), Some("Residentiel"));
    assert_eq!(out.get(WILAYA), Some("ALGER"));
    assert_eq!(out.get(CITY), Some("BAB EZZOUAR"));
    assert_eq!(out.get(SUPPLIER), Some("POWER_ALGERIA"));
    assert_eq!(out.get(SUBSCRIBED_POWER), Some("6.0"));
    assert_eq!(out.get(POSTAL_CODE), Some("16024"));
    assert_eq!(out.get(TARIFF), Some("0.12"));
}

#[test]
fn transformer_derives_fields() {
    let out = MeterTransformer.apply(MeterNormalizer.apply(reading("123456", "3 kWh")));
    assert_eq!(out.get(CONSUMPTION_8H), Some("24.00000 kWh"));
    assert_eq!(out.get(CLIENT_CATEGORY), Some("Consommation moyenne"));
    assert_eq!(out.get(CONSUMPTION_RATIO), Some("0.5"));
}

#[test]
fn categories_split_at_thresholds() {
    assert_eq!(MeterTransformer::category(1.669), "Faible consommation");
    assert_eq!(MeterTransformer::category(1.67), "Consommation moyenne");
    assert_eq!(MeterTransformer::category(6.67), "Forte consommation");
}
