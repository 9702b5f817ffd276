//! In-memory tabular data exchanged between stages and read from uploads.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

use crate::store::ensure_parent;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsvError {
    #[error("input is empty or contains no header row")]
    Empty,
    #[error("header contains an empty column name at position {0}")]
    EmptyHeader(usize),
    #[error("header contains duplicate column '{0}'")]
    DuplicateHeader(String),
    #[error("line {line}: expected {expected} fields but found {found}")]
    RaggedRow {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: unterminated quoted field")]
    UnterminatedQuote { line: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Dataset {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != headers.len() {
                bail!(
                    "Row {} has {} values but the dataset has {} columns",
                    idx + 1,
                    row.len(),
                    headers.len()
                );
            }
        }
        Ok(Self { headers, rows })
    }

    pub fn from_csv_str(input: &str) -> Result<Self, CsvError> {
        let input = input.strip_prefix('\u{feff}').unwrap_or(input);
        let mut records = parse_records(input)?.into_iter();
        let (_, header) = records.next().ok_or(CsvError::Empty)?;

        let headers: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();
        let mut seen = HashSet::new();
        for (idx, name) in headers.iter().enumerate() {
            if name.is_empty() {
                return Err(CsvError::EmptyHeader(idx + 1));
            }
            if !seen.insert(name.as_str()) {
                return Err(CsvError::DuplicateHeader(name.clone()));
            }
        }

        let mut rows = Vec::new();
        for (line, record) in records {
            if record.len() != headers.len() {
                return Err(CsvError::RaggedRow {
                    line,
                    expected: headers.len(),
                    found: record.len(),
                });
            }
            rows.push(record);
        }

        Ok(Self { headers, rows })
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;
        Self::from_csv_str(&content)
            .with_context(|| format!("Failed to parse CSV file: {}", path.display()))
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        fs::write(path, self.to_csv_string())
            .with_context(|| format!("Failed to write CSV file: {}", path.display()))
    }

    pub fn to_csv_string(&self) -> String {
        let mut out = String::new();
        write_record(&mut out, &self.headers);
        for row in &self.rows {
            write_record(&mut out, row);
        }
        out
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| row[idx].as_str()).collect())
    }

    /// Values of `name` as floats; missing or unparsable cells become NaN.
    pub fn numeric_column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| parse_cell(&row[idx])).collect())
    }

    /// Row-major float matrix over `columns`, in the given order.
    pub fn numeric_matrix(&self, columns: &[String]) -> Result<Vec<Vec<f64>>> {
        let indices = columns
            .iter()
            .map(|name| {
                self.column_index(name)
                    .with_context(|| format!("Missing column '{name}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&idx| parse_cell(&row[idx])).collect())
            .collect())
    }

    /// First cell among `columns` that is neither missing nor a number, as
    /// `(column, 1-based data row, cell)`.
    pub fn first_non_numeric(&self, columns: &[String]) -> Option<(String, usize, String)> {
        for (row_idx, row) in self.rows.iter().enumerate() {
            for name in columns {
                let Some(idx) = self.column_index(name) else {
                    continue;
                };
                let cell = &row[idx];
                if !is_missing(cell) && cell.trim().parse::<f64>().is_err() {
                    return Some((name.clone(), row_idx + 1, cell.clone()));
                }
            }
        }
        None
    }

    pub fn drop_columns(&mut self, names: &[String]) {
        let drop: Vec<usize> = self
            .headers
            .iter()
            .enumerate()
            .filter(|(_, h)| names.contains(h))
            .map(|(idx, _)| idx)
            .collect();
        if drop.is_empty() {
            return;
        }
        let keep = |idx: &usize| !drop.contains(idx);
        self.headers = retain_indices(std::mem::take(&mut self.headers), keep);
        self.rows = std::mem::take(&mut self.rows)
            .into_iter()
            .map(|row| retain_indices(row, keep))
            .collect();
    }

    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<String>) -> Result<()> {
        let name = name.into();
        if values.len() != self.rows.len() {
            bail!(
                "Column '{}' has {} values but the dataset has {} rows",
                name,
                values.len(),
                self.rows.len()
            );
        }
        if self.column_index(&name).is_some() {
            bail!("Column '{name}' already exists");
        }
        self.headers.push(name);
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Concatenate `other` below `self`. Both must share the same header.
    pub fn append(&mut self, other: Dataset) -> Result<()> {
        if self.headers.is_empty() && self.rows.is_empty() {
            *self = other;
            return Ok(());
        }
        if self.headers != other.headers {
            bail!(
                "Cannot concatenate datasets with different headers: [{}] vs [{}]",
                self.headers.join(","),
                other.headers.join(",")
            );
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Shuffle with a seeded RNG and split off `test_ratio` of the rows.
    /// Both halves are non-empty whenever the dataset has at least two rows.
    pub fn train_test_split(&self, test_ratio: f64, seed: u64) -> (Dataset, Dataset) {
        let mut indices: Vec<usize> = (0..self.rows.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let total = indices.len();
        let mut test_len = (total as f64 * test_ratio).round() as usize;
        if total >= 2 {
            test_len = test_len.clamp(1, total - 1);
        } else {
            test_len = 0;
        }

        let (test_idx, train_idx) = indices.split_at(test_len);
        (self.select_rows(train_idx), self.select_rows(test_idx))
    }

    pub fn select_rows(&self, indices: &[usize]) -> Dataset {
        Dataset {
            headers: self.headers.clone(),
            rows: indices.iter().map(|&idx| self.rows[idx].clone()).collect(),
        }
    }
}

pub fn is_missing(cell: &str) -> bool {
    matches!(
        cell.trim().to_ascii_lowercase().as_str(),
        "" | "na" | "nan" | "null" | "none"
    )
}

pub fn parse_cell(cell: &str) -> f64 {
    if is_missing(cell) {
        return f64::NAN;
    }
    cell.trim().parse().unwrap_or(f64::NAN)
}

fn retain_indices<T>(values: Vec<T>, keep: impl Fn(&usize) -> bool) -> Vec<T> {
    values
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| keep(idx))
        .map(|(_, value)| value)
        .collect()
}

fn parse_records(input: &str) -> Result<Vec<(usize, Vec<String>)>, CsvError> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut line = 1usize;
    let mut record_line = 1usize;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => quoted = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() && !was_quoted => {
                quoted = true;
                was_quoted = true;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                was_quoted = false;
            }
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                was_quoted = false;
                let finished = std::mem::take(&mut record);
                // Blank lines carry no data.
                if !(finished.len() == 1 && finished[0].trim().is_empty()) {
                    records.push((record_line, finished));
                }
                line += 1;
                record_line = line;
            }
            _ => field.push(c),
        }
    }

    if quoted {
        return Err(CsvError::UnterminatedQuote { line: record_line });
    }
    if !field.is_empty() || !record.is_empty() || was_quoted {
        record.push(field);
        records.push((record_line, record));
    }

    Ok(records)
}

fn write_record(out: &mut String, fields: &[String]) {
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}
