//! Raw, holder specific rows.
//!
//! A [`RawTable`] holds the rows of one holder exactly as they were exported: arbitrary columns,
//! dirty strings and missing cells included. Tables are column-major and never modified after
//! loading except for removing columns that are not features.

use std::{
    collections::HashSet,
    fmt,
    fs::File,
    io::{self, Read},
    path::Path,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The label column of the fraud datasets.
pub const DEFAULT_LABEL_COLUMN: &str = "is_fraud";

/// Identifier and time columns that never enter the feature vector.
pub const DEFAULT_NON_FEATURE_COLUMNS: [&str; 4] =
    ["transaction_id", "timestamp", "tx_id", "unix_timestamp"];

/// Cell contents treated as missing.
const MISSING_MARKERS: [&str; 9] = ["", "NA", "N/A", "NaN", "nan", "null", "NULL", "None", "<NA>"];

/// Errors related to loading raw tables.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("the dataset has no label column `{0}`")]
    MissingLabelColumn(String),
    #[error("row {row}: `{value}` is not a binary label")]
    InvalidLabel { row: usize, value: String },
    #[error("column `{0}` appears more than once")]
    DuplicateColumn(String),
    #[error("failed to parse csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to read the dataset: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single cell of a raw row.
pub enum RawValue {
    Missing,
    /// A numeric cell and the text it was read from. Categories are rendered from the text, so
    /// `007` stays `007` in the feature names.
    Number { value: f64, text: String },
    Text(String),
}

impl RawValue {
    /// Creates a numeric cell rendered with the shortest representation (`5`, `2.5`).
    pub fn number(value: f64) -> Self {
        RawValue::Number {
            value,
            text: value.to_string(),
        }
    }

    /// Parses a csv cell.
    pub fn parse(cell: &str) -> Self {
        let trimmed = cell.trim();
        if MISSING_MARKERS.contains(&trimmed) {
            return RawValue::Missing;
        }
        match trimmed.parse::<f64>() {
            Ok(value) => RawValue::Number {
                value,
                text: cell.to_string(),
            },
            Err(_) => RawValue::Text(cell.to_string()),
        }
    }

    /// Converts a json value. Strings are kept as text even if they look numeric.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => RawValue::Missing,
            Value::Bool(true) => RawValue::Text("True".to_string()),
            Value::Bool(false) => RawValue::Text("False".to_string()),
            Value::Number(number) => number
                .as_f64()
                .map(RawValue::number)
                .unwrap_or(RawValue::Missing),
            Value::String(text) if MISSING_MARKERS.contains(&text.trim()) => RawValue::Missing,
            Value::String(text) => RawValue::Text(text.clone()),
            other => RawValue::Text(other.to_string()),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, RawValue::Missing)
    }
}

impl fmt::Display for RawValue {
    /// Renders the value as a category, numbers as the text they were read from.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Missing => write!(f, "NA"),
            RawValue::Number { text, .. } | RawValue::Text(text) => write!(f, "{}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Column {
    name: String,
    values: Vec<RawValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
/// The raw rows of one holder in column-major layout.
pub struct RawTable {
    columns: Vec<Column>,
    rows: usize,
}

impl RawTable {
    /// Reads a headered csv file.
    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self, TableError> {
        Self::from_csv_reader(File::open(path)?)
    }

    /// Reads headered csv data.
    pub fn from_csv_reader(reader: impl Read) -> Result<Self, TableError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::Headers)
            .from_reader(reader);

        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for name in reader.headers()?.iter() {
            if !seen.insert(name.to_string()) {
                return Err(TableError::DuplicateColumn(name.to_string()));
            }
            columns.push(Column {
                name: name.to_string(),
                values: Vec::new(),
            });
        }

        let mut rows = 0;
        for record in reader.records() {
            let record = record?;
            for (column, cell) in columns.iter_mut().zip(record.iter()) {
                column.values.push(RawValue::parse(cell));
            }
            rows += 1;
        }

        Ok(Self { columns, rows })
    }

    /// Builds a table from json objects. Columns appear in first-seen order and keys absent from
    /// a record are missing cells.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Map<String, Value>>) -> Self {
        let mut table = RawTable::default();
        for record in records {
            for (name, value) in record {
                let position = match table.position(name) {
                    Some(position) => position,
                    None => {
                        table.columns.push(Column {
                            name: name.clone(),
                            values: vec![RawValue::Missing; table.rows],
                        });
                        table.columns.len() - 1
                    }
                };
                table.columns[position].values.push(RawValue::from_json(value));
            }
            table.rows += 1;
            for column in table.columns.iter_mut() {
                column.values.resize(table.rows, RawValue::Missing);
            }
        }
        table
    }

    /// Gets the number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Gets the column names in table order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }

    /// Gets the cells of a column.
    pub fn column(&self, name: &str) -> Option<&[RawValue]> {
        self.position(name)
            .map(|position| self.columns[position].values.as_slice())
    }

    /// Checks whether a column holds categories, i.e. any of its cells is text.
    pub fn is_categorical(&self, name: &str) -> bool {
        self.column(name)
            .map(|values| values.iter().any(|value| matches!(value, RawValue::Text(_))))
            .unwrap_or(false)
    }

    /// Removes the given columns if present.
    pub fn drop_columns<S: AsRef<str>>(&mut self, names: &[S]) {
        self.columns
            .retain(|column| !names.iter().any(|name| name.as_ref() == column.name));
    }

    /// Removes the label column and returns it as `0.0`/`1.0` values.
    ///
    /// # Errors
    /// Fails with [`TableError::MissingLabelColumn`] if the column does not exist and with
    /// [`TableError::InvalidLabel`] if a cell is not a binary label.
    pub fn split_label(mut self, name: &str) -> Result<(RawTable, Vec<f32>), TableError> {
        let position = self
            .position(name)
            .ok_or_else(|| TableError::MissingLabelColumn(name.to_string()))?;
        let column = self.columns.remove(position);
        let labels = column
            .values
            .iter()
            .enumerate()
            .map(|(row, value)| parse_label(value).ok_or_else(|| TableError::InvalidLabel {
                row,
                value: value.to_string(),
            }))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((self, labels))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

/// Reads a binary label: `0`/`1` numbers or `0`, `1`, `true` and `false` text.
pub fn parse_label(value: &RawValue) -> Option<f32> {
    match value {
        RawValue::Number { value, .. } if *value == 0.0 => Some(0.0),
        RawValue::Number { value, .. } if *value == 1.0 => Some(1.0),
        RawValue::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "0" | "0.0" | "false" => Some(0.0),
            "1" | "1.0" | "true" => Some(1.0),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const CSV: &str = "\
transaction_id,amount,channel,is_fraud
t1,120.5,web,0
t2,_--_500000,,1
t3,NaN,atm,False
";

    #[test]
    fn test_parse_cells() {
        assert!(matches!(
            RawValue::parse(" 12.5 "),
            RawValue::Number { value, .. } if value == 12.5
        ));
        assert_eq!(RawValue::parse("NaN"), RawValue::Missing);
        assert_eq!(RawValue::parse(""), RawValue::Missing);
        assert_eq!(
            RawValue::parse("_--_500000"),
            RawValue::Text("_--_500000".to_string())
        );
        assert_eq!(RawValue::number(5.0).to_string(), "5");
        assert_eq!(RawValue::number(2.5).to_string(), "2.5");
    }

    #[test]
    fn test_numeric_cells_keep_their_text() {
        assert_eq!(
            RawValue::parse("007"),
            RawValue::Number {
                value: 7.0,
                text: "007".to_string()
            }
        );
        assert_eq!(RawValue::parse("007").to_string(), "007");
        assert_eq!(RawValue::parse("1.50").to_string(), "1.50");
        assert_eq!(RawValue::parse("Infinity").to_string(), "Infinity");

        // csv and json cells of the same category render alike
        let table = RawTable::from_csv_reader("merchant\nshop\n007\n".as_bytes()).unwrap();
        assert!(table.is_categorical("merchant"));
        assert_eq!(
            table.column("merchant").unwrap()[1].to_string(),
            RawValue::from_json(&json!("007")).to_string()
        );
    }

    #[test]
    fn test_from_csv_reader() {
        let table = RawTable::from_csv_reader(CSV.as_bytes()).unwrap();
        assert_eq!(table.rows(), 3);
        assert_eq!(
            table.column_names().collect::<Vec<_>>(),
            vec!["transaction_id", "amount", "channel", "is_fraud"]
        );
        assert_eq!(table.column("channel").unwrap()[1], RawValue::Missing);
        assert!(table.is_categorical("channel"));
        assert!(table.is_categorical("amount"));
        assert!(!table.is_categorical("unknown"));
    }

    #[test]
    fn test_split_label_and_drop_columns() {
        let mut table = RawTable::from_csv_reader(CSV.as_bytes()).unwrap();
        table.drop_columns(&DEFAULT_NON_FEATURE_COLUMNS);
        let (features, labels) = table.split_label(DEFAULT_LABEL_COLUMN).unwrap();

        assert_eq!(labels, vec![0.0, 1.0, 0.0]);
        assert_eq!(
            features.column_names().collect::<Vec<_>>(),
            vec!["amount", "channel"]
        );
    }

    #[test]
    fn test_missing_and_invalid_labels() {
        let table = RawTable::from_csv_reader("a,b\n1,2\n".as_bytes()).unwrap();
        assert!(matches!(
            table.split_label(DEFAULT_LABEL_COLUMN),
            Err(TableError::MissingLabelColumn(name)) if name == "is_fraud"
        ));

        let table = RawTable::from_csv_reader("a,is_fraud\n1,0\n2,maybe\n".as_bytes()).unwrap();
        assert!(matches!(
            table.split_label(DEFAULT_LABEL_COLUMN),
            Err(TableError::InvalidLabel { row: 1, .. })
        ));
    }

    #[test]
    fn test_duplicate_columns() {
        assert!(matches!(
            RawTable::from_csv_reader("a,a\n1,2\n".as_bytes()),
            Err(TableError::DuplicateColumn(_))
        ));
    }

    #[test]
    fn test_from_records() {
        let records = vec![
            json!({"amount": 10, "merchant": "grocery"}),
            json!({"merchant": "fuel", "vip": true}),
        ];
        let records: Vec<Map<String, Value>> = records
            .into_iter()
            .map(|value| value.as_object().unwrap().clone())
            .collect();

        let table = RawTable::from_records(&records);

        assert_eq!(table.rows(), 2);
        assert_eq!(
            table.column("amount").unwrap(),
            &[RawValue::number(10.0), RawValue::Missing]
        );
        assert_eq!(
            table.column("vip").unwrap(),
            &[RawValue::Missing, RawValue::Text("True".to_string())]
        );
    }
}
