//! Column-oriented numeric table with named, unit-aware columns.
//!
//! This is the tabular collaborator the measurement record is built from: CSV ingest
//! produces a `Table`, the record keeps the auxiliary (non-trace) columns in one, and
//! result tables of the correlation analysis are exported from one.

use std::collections::HashMap;

use crate::error::AppError;

/// One named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<f64>,
}

/// Rectangular table of `f64` columns plus a units dictionary keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
    units: HashMap<String, String>,
    rows: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `(name, values)` pairs; all columns must have the same length.
    pub fn from_columns<I, S>(columns: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let mut table = Table::new();
        for (name, values) in columns {
            table.push_column(name, values)?;
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.position(name).map(|i| self.columns[i].values.as_slice())
    }

    /// Like `get`, with a descriptive error (exit code 2) for a missing column.
    pub fn column(&self, name: &str) -> Result<&[f64], AppError> {
        self.get(name).ok_or_else(|| {
            AppError::new(
                2,
                format!(
                    "Missing column '{name}'. Available columns: {}.",
                    self.column_names().join(", ")
                ),
            )
        })
    }

    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<(), AppError> {
        let name = name.into();
        if self.has_column(&name) {
            return Err(AppError::new(2, format!("Duplicate column '{name}'.")));
        }
        if !self.columns.is_empty() && values.len() != self.rows {
            return Err(AppError::new(
                2,
                format!(
                    "Column '{name}' has {} rows, table has {}.",
                    values.len(),
                    self.rows
                ),
            ));
        }
        self.rows = values.len();
        self.columns.push(Column { name, values });
        Ok(())
    }

    /// Remove a column and its unit, returning its values. The row count is kept.
    pub fn remove_column(&mut self, name: &str) -> Option<Vec<f64>> {
        let i = self.position(name)?;
        self.units.remove(name);
        Some(self.columns.remove(i).values)
    }

    /// Rename every column positionally; `names` must have one entry per column.
    pub fn rename_columns<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), AppError> {
        if names.len() != self.columns.len() {
            return Err(AppError::new(
                2,
                format!(
                    "Expected {} column names, got {}.",
                    self.columns.len(),
                    names.len()
                ),
            ));
        }
        let old: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        for (from, to) in old.iter().zip(names.iter()) {
            self.rename(from, to.as_ref())?;
        }
        Ok(())
    }

    /// Rename a single column, carrying its unit along.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), AppError> {
        if from == to {
            return Ok(());
        }
        if self.has_column(to) {
            return Err(AppError::new(2, format!("Cannot rename '{from}' to existing column '{to}'.")));
        }
        let i = self
            .position(from)
            .ok_or_else(|| AppError::new(2, format!("Cannot rename missing column '{from}'.")))?;
        self.columns[i].name = to.to_string();
        if let Some(unit) = self.units.remove(from) {
            self.units.insert(to.to_string(), unit);
        }
        Ok(())
    }

    /// Assign units to columns. Unknown column names are ignored.
    pub fn give_units<K, V>(&mut self, units: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (name, unit) in units {
            let name = name.into();
            if self.has_column(&name) {
                self.units.insert(name, unit.into());
            }
        }
    }

    pub fn unit(&self, name: &str) -> Option<&str> {
        self.units.get(name).map(String::as_str)
    }

    /// Compute a new column row by row from the existing ones.
    ///
    /// The closure receives a [`Row`] view that resolves other columns by name.
    pub fn derive_column<F>(&mut self, name: &str, unit: Option<&str>, formula: F) -> Result<(), AppError>
    where
        F: Fn(&Row<'_>) -> f64,
    {
        let values: Vec<f64> = (0..self.rows)
            .map(|index| formula(&Row { table: self, index }))
            .collect();
        self.push_column(name, values)?;
        if let Some(unit) = unit {
            self.units.insert(name.to_string(), unit.to_string());
        }
        Ok(())
    }

    /// Scale a column in place (used for unit conversion at ingest).
    pub fn scale_column(&mut self, name: &str, factor: f64) -> Result<(), AppError> {
        let i = self
            .position(name)
            .ok_or_else(|| AppError::new(2, format!("Cannot scale missing column '{name}'.")))?;
        for v in &mut self.columns[i].values {
            *v *= factor;
        }
        Ok(())
    }

    /// Keep only rows whose mask entry is `true`.
    pub fn retain_rows(&mut self, mask: &[bool]) {
        debug_assert_eq!(mask.len(), self.rows);
        for column in &mut self.columns {
            let mut keep = mask.iter();
            column.values.retain(|_| keep.next().copied().unwrap_or(false));
        }
        self.rows = mask.iter().take(self.rows).filter(|&&k| k).count();
    }

    /// Keep only the rows in `range` (clamped to the table).
    pub fn crop(&mut self, range: std::ops::Range<usize>) {
        let start = range.start.min(self.rows);
        let end = range.end.clamp(start, self.rows);
        for column in &mut self.columns {
            column.values.truncate(end);
            column.values.drain(..start);
        }
        self.rows = end - start;
    }

    /// Copy of the rows selected by `indices`, in that order.
    pub fn select_rows(&self, indices: &[usize]) -> Table {
        let columns = self
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                values: indices.iter().filter_map(|&i| c.values.get(i).copied()).collect(),
            })
            .collect();
        Table {
            columns,
            units: self.units.clone(),
            rows: indices.iter().filter(|&&i| i < self.rows).count(),
        }
    }

    /// Split off the named columns into a new table (units included).
    pub fn take_columns(&mut self, names: &[&str]) -> Result<Table, AppError> {
        let mut out = Table::new();
        for &name in names {
            let unit = self.units.get(name).cloned();
            let values = self
                .remove_column(name)
                .ok_or_else(|| AppError::new(2, format!("Missing column '{name}'.")))?;
            out.push_column(name, values)?;
            if let Some(unit) = unit {
                out.units.insert(name.to_string(), unit);
            }
        }
        Ok(out)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Row view handed to `derive_column` formulas.
pub struct Row<'a> {
    table: &'a Table,
    index: usize,
}

impl Row<'_> {
    /// Value of column `name` in this row; NaN when the column does not exist.
    pub fn get(&self, name: &str) -> f64 {
        self.table
            .get(name)
            .and_then(|values| values.get(self.index))
            .copied()
            .unwrap_or(f64::NAN)
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::from_columns([
            ("power", vec![-10.0, -10.0, -20.0]),
            ("freq", vec![1.0, 2.0, 3.0]),
            ("real", vec![3.0, 0.0, 1.0]),
            ("imag", vec![4.0, 1.0, 0.0]),
        ])
        .unwrap()
    }

    #[test]
    fn rename_keeps_units_attached() {
        let mut t = sample();
        t.give_units([("freq", "GHz"), ("missing", "V")]);
        t.rename_columns(&["power", "f", "re", "im"]).unwrap();
        assert_eq!(t.unit("f"), Some("GHz"));
        assert_eq!(t.unit("freq"), None);
        assert!(t.unit("missing").is_none());
        assert_eq!(t.get("re").unwrap(), &[3.0, 0.0, 1.0]);
    }

    #[test]
    fn derived_column_reads_other_columns() {
        let mut t = sample();
        t.derive_column("mag", Some("1"), |row| row.get("real").hypot(row.get("imag")))
            .unwrap();
        assert_eq!(t.get("mag").unwrap(), &[5.0, 1.0, 1.0]);
        assert_eq!(t.unit("mag"), Some("1"));
        assert!(t.derive_column("mag", None, |_| 0.0).is_err());
    }

    #[test]
    fn row_filters_apply_to_every_column() {
        let mut t = sample();
        t.retain_rows(&[true, false, true]);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get("freq").unwrap(), &[1.0, 3.0]);

        t.crop(1..10);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get("power").unwrap(), &[-20.0]);
    }

    #[test]
    fn mismatched_lengths_and_missing_columns_are_errors() {
        let mut t = sample();
        assert!(t.push_column("short", vec![1.0]).is_err());
        let err = t.column("nope").unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("freq"));
    }

    #[test]
    fn take_columns_moves_data_and_units() {
        let mut t = sample();
        t.give_units([("freq", "Hz")]);
        let trace = t.take_columns(&["freq", "real"]).unwrap();
        assert_eq!(trace.column_names(), vec!["freq", "real"]);
        assert_eq!(trace.unit("freq"), Some("Hz"));
        assert_eq!(t.column_names(), vec!["power", "imag"]);
        assert_eq!(t.len(), 3);
    }
}
