//! Row validators synthesized from relation schemas
//!
//! A validator is an ordered list of `(column, required, converter)` rules.
//! It takes the raw text cells of one tuple and produces a typed row map,
//! enforcing that NOT NULL columns are present. Full-row and key-only
//! validators differ only in the column subset they carry.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime};
use rust_decimal::Decimal;
use tracing::warn;

use crate::core::errors::DecodeError;
use crate::events::{ColumnDefinition, PgValue, Row};
use crate::protocol::Cell;

/// Conversion applied to a column's wire text, selected by its type name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeConverter {
    Integer,
    Timestamp,
    TimestampTz,
    Json,
    Numeric,
    Text,
}

impl TypeConverter {
    /// Pick the converter for a `format_type` style type name.
    pub fn for_type_name(type_name: &str) -> Self {
        match type_name {
            "bigint" | "integer" | "smallint" => TypeConverter::Integer,
            "timestamp with time zone" => TypeConverter::TimestampTz,
            "timestamp without time zone" => TypeConverter::Timestamp,
            "json" | "jsonb" => TypeConverter::Json,
            name if name.starts_with("numeric") => TypeConverter::Numeric,
            _ => TypeConverter::Text,
        }
    }

    /// Convert one wire text value. Falls back to the raw string when the
    /// text does not parse, so a surprising value never loses data.
    fn convert(&self, column: &str, raw: &str) -> PgValue {
        match self {
            TypeConverter::Integer => match raw.parse::<i64>() {
                Ok(value) => PgValue::Integer(value),
                Err(err) => {
                    warn!("integer column {column} failed to parse: {err}");
                    PgValue::Text(raw.to_owned())
                }
            },
            TypeConverter::TimestampTz => {
                match DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
                    Ok(value) => PgValue::TimestampTz(value.to_utc()),
                    Err(err) => {
                        warn!("timestamptz column {column} failed to parse: {err}");
                        PgValue::Text(raw.to_owned())
                    }
                }
            }
            TypeConverter::Timestamp => {
                match NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
                    Ok(value) => PgValue::Timestamp(value),
                    Err(err) => {
                        warn!("timestamp column {column} failed to parse: {err}");
                        PgValue::Text(raw.to_owned())
                    }
                }
            }
            TypeConverter::Json => match serde_json::from_str(raw) {
                Ok(value) => PgValue::Json(value),
                Err(err) => {
                    warn!("json column {column} failed to parse: {err}");
                    PgValue::Text(raw.to_owned())
                }
            },
            TypeConverter::Numeric => match raw.parse::<Decimal>() {
                Ok(value) => PgValue::Numeric(value),
                Err(err) => {
                    warn!("numeric column {column} failed to parse: {err}");
                    PgValue::Text(raw.to_owned())
                }
            },
            TypeConverter::Text => PgValue::Text(raw.to_owned()),
        }
    }
}

#[derive(Debug, Clone)]
struct ColumnRule {
    name: String,
    required: bool,
    converter: TypeConverter,
}

/// Converts a raw tuple map into a typed [`Row`] for one relation
#[derive(Debug, Clone)]
pub struct RowValidator {
    rules: Vec<ColumnRule>,
}

impl RowValidator {
    /// Validator over every column of the relation
    pub fn full_row(columns: &[ColumnDefinition]) -> Self {
        Self::from_columns(columns.iter())
    }

    /// Validator over the primary key columns only, for `K` old-row images
    pub fn key_only(columns: &[ColumnDefinition]) -> Self {
        Self::from_columns(columns.iter().filter(|col| col.part_of_pkey))
    }

    fn from_columns<'a, I: Iterator<Item = &'a ColumnDefinition>>(columns: I) -> Self {
        Self {
            rules: columns
                .map(|col| ColumnRule {
                    name: col.name.clone(),
                    required: !col.optional,
                    converter: TypeConverter::for_type_name(&col.type_name),
                })
                .collect(),
        }
    }

    /// Number of columns this validator covers
    pub fn column_count(&self) -> usize {
        self.rules.len()
    }

    /// Validate a raw cell map.
    ///
    /// Required columns must be present; unchanged-TOAST cells pass through
    /// as the [`PgValue::UnchangedToast`] sentinel and columns not covered by
    /// the rules are ignored.
    pub fn validate(&self, raw: &HashMap<String, Cell>) -> Result<Row, DecodeError> {
        let mut row = Row::with_capacity(self.rules.len());
        for rule in &self.rules {
            match raw.get(&rule.name) {
                None => {
                    if rule.required {
                        return Err(DecodeError::missing_required_column(rule.name.clone()));
                    }
                }
                Some(Cell::Null) => {
                    row.insert(rule.name.clone(), PgValue::Null);
                }
                Some(Cell::UnchangedToast) => {
                    row.insert(rule.name.clone(), PgValue::UnchangedToast);
                }
                Some(Cell::Text(text)) => {
                    row.insert(rule.name.clone(), rule.converter.convert(&rule.name, text));
                }
            }
        }
        Ok(row)
    }
}
