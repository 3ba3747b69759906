//! Typed rows of the imported datasets.
//!
//! Bulk copy output is delimiter-separated text with no quoting. Parsing into
//! a typed record turns a short, long, or misaligned row into a `RecordError`
//! instead of a record with shifted fields.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;

use crate::error::{ColumnCountSnafu, EmptyFieldSnafu, InvalidFieldSnafu, RecordError};

/// Schema of an imported dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Customers,
    Orders,
}

impl Dataset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::Customers => "customers",
            Dataset::Orders => "orders",
        }
    }

    /// Parse one delimited row.
    pub fn parse_row(&self, line: &str, delimiter: char) -> Result<DatasetRecord, RecordError> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(delimiter).collect();
        Ok(match self {
            Dataset::Customers => DatasetRecord::Customer(CustomerRecord::from_fields(&fields)?),
            Dataset::Orders => DatasetRecord::Order(OrderRecord::from_fields(&fields)?),
        })
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed row of either dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DatasetRecord {
    Customer(CustomerRecord),
    Order(OrderRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomerRecord {
    pub customer_id: u64,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: String,
}

impl CustomerRecord {
    const DATASET: &'static str = "customers";
    const COLUMNS: usize = 7;

    pub fn from_fields(fields: &[&str]) -> Result<Self, RecordError> {
        let d = Self::DATASET;
        check_columns(d, fields, Self::COLUMNS)?;
        Ok(Self {
            customer_id: parse_id(d, "customer_id", fields[0])?,
            first_name: required(d, "first_name", fields[1])?,
            last_name: required(d, "last_name", fields[2])?,
            email: optional(fields[3]),
            city: optional(fields[4]),
            state: optional(fields[5]),
            country: required(d, "country", fields[6])?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRecord {
    pub order_id: u64,
    pub customer_id: u64,
    pub order_date: NaiveDateTime,
    pub order_status: String,
    pub amount: f64,
}

impl OrderRecord {
    const DATASET: &'static str = "orders";
    const COLUMNS: usize = 5;

    pub fn from_fields(fields: &[&str]) -> Result<Self, RecordError> {
        let d = Self::DATASET;
        check_columns(d, fields, Self::COLUMNS)?;

        let raw_amount = required(d, "amount", fields[4])?;
        let amount = raw_amount
            .parse::<f64>()
            .ok()
            .filter(|a| a.is_finite())
            .context(InvalidFieldSnafu {
                dataset: d,
                field: "amount",
                value: raw_amount.as_str(),
            })?;

        Ok(Self {
            order_id: parse_id(d, "order_id", fields[0])?,
            customer_id: parse_id(d, "customer_id", fields[1])?,
            order_date: parse_timestamp(d, "order_date", fields[2])?,
            order_status: required(d, "order_status", fields[3])?,
            amount,
        })
    }
}

fn check_columns(dataset: &'static str, fields: &[&str], expected: usize) -> Result<(), RecordError> {
    ensure!(
        fields.len() == expected,
        ColumnCountSnafu {
            dataset,
            expected,
            found: fields.len(),
        }
    );
    Ok(())
}

/// Bulk copy writes SQL NULL as the literal `null`.
fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty() && value != "null").then(|| value.to_string())
}

fn required(dataset: &'static str, field: &'static str, value: &str) -> Result<String, RecordError> {
    optional(value).context(EmptyFieldSnafu { dataset, field })
}

fn parse_id(dataset: &'static str, field: &'static str, value: &str) -> Result<u64, RecordError> {
    let value = required(dataset, field, value)?;
    value.parse().ok().context(InvalidFieldSnafu {
        dataset,
        field,
        value: value.as_str(),
    })
}

fn parse_timestamp(
    dataset: &'static str,
    field: &'static str,
    value: &str,
) -> Result<NaiveDateTime, RecordError> {
    let value = required(dataset, field, value)?;
    NaiveDateTime::parse_from_str(&value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .context(InvalidFieldSnafu {
            dataset,
            field,
            value: value.as_str(),
        })
}
