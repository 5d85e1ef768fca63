//! Core data types: named tables, observation series, windows and cells.
//!
//! Tables are time-major: row `t` is time step `t`, column `j` is variable `j`.
//! Runtime-sized nalgebra matrices are used throughout so any model adapter
//! can define its own variable set.

use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::errors::{DaError, DaResult};

/// Opaque model state carried between windows (e.g. layer temperatures, SWE).
pub type ModelState = DVector<f64>;

/// Grid coordinates of the cell being assimilated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellIndex {
    /// Row (latitude) index
    pub lat: usize,
    /// Column (longitude) index
    pub lon: usize,
}

impl CellIndex {
    /// Create a new cell index
    pub fn new(lat: usize, lon: usize) -> Self {
        Self { lat, lon }
    }

    /// `"<lat>_<lon>"`, used in storage keys.
    pub fn tag(&self) -> String {
        format!("{}_{}", self.lat, self.lon)
    }
}

/// Contiguous half-open block of time steps `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssimilationWindow {
    /// Position of this window in the run
    pub index: usize,
    /// First step (inclusive)
    pub start: usize,
    /// Last step (exclusive)
    pub end: usize,
}

impl AssimilationWindow {
    /// Create a new window
    pub fn new(index: usize, start: usize, end: usize) -> Self {
        Self { index, start, end }
    }

    /// Number of steps in the window.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True for a zero-length window.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Step indices covered by the window.
    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Time-indexed table with named columns.
///
/// Serialized column by column; missing (NaN) entries become `null`. JSON has
/// no infinities, so a table holding one refuses to serialize rather than
/// coming back as missing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ColumnTable")]
pub struct DataTable {
    variables: Vec<String>,
    values: DMatrix<f64>,
}

/// On-disk layout of a [`DataTable`].
#[derive(Serialize, Deserialize)]
struct ColumnTable {
    steps: usize,
    columns: Vec<(String, Vec<Option<f64>>)>,
}

impl TryFrom<&DataTable> for ColumnTable {
    type Error = DaError;

    fn try_from(table: &DataTable) -> DaResult<Self> {
        let mut columns = Vec::with_capacity(table.num_variables());
        for (j, name) in table.variables.iter().enumerate() {
            let mut data = Vec::with_capacity(table.steps());
            for (t, &v) in table.values.column(j).iter().enumerate() {
                if v.is_infinite() {
                    return Err(DaError::numerical(format!(
                        "cannot store infinite '{}' at step {}",
                        name, t
                    )));
                }
                data.push(if v.is_nan() { None } else { Some(v) });
            }
            columns.push((name.clone(), data));
        }
        Ok(Self {
            steps: table.steps(),
            columns,
        })
    }
}

impl Serialize for DataTable {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let columns =
            ColumnTable::try_from(self).map_err(<S::Error as serde::ser::Error>::custom)?;
        columns.serialize(serializer)
    }
}

impl TryFrom<ColumnTable> for DataTable {
    type Error = DaError;

    fn try_from(raw: ColumnTable) -> DaResult<Self> {
        let steps = raw.steps;
        let mut table = DataTable::filled(
            raw.columns.iter().map(|(n, _)| n.clone()).collect(),
            steps,
            f64::NAN,
        );
        for (j, (name, data)) in raw.columns.into_iter().enumerate() {
            if data.len() != steps {
                return Err(DaError::DimensionMismatch {
                    expected: steps,
                    actual: data.len(),
                    context: format!("stored column '{}'", name),
                });
            }
            for (t, v) in data.into_iter().enumerate() {
                table.values[(t, j)] = v.unwrap_or(f64::NAN);
            }
        }
        Ok(table)
    }
}

/// Meteorological forcing consumed by the model.
pub type ForcingTable = DataTable;

/// Simulated model output trajectory.
pub type OutputTable = DataTable;

impl DataTable {
    /// Create a table, checking that the column count matches the names.
    pub fn new(variables: Vec<String>, values: DMatrix<f64>) -> DaResult<Self> {
        if variables.len() != values.ncols() {
            return Err(DaError::DimensionMismatch {
                expected: variables.len(),
                actual: values.ncols(),
                context: "table columns".to_string(),
            });
        }
        Ok(Self { variables, values })
    }

    /// Build a table from named columns of equal length.
    pub fn from_columns(columns: Vec<(String, Vec<f64>)>) -> DaResult<Self> {
        let steps = columns.first().map_or(0, |(_, c)| c.len());
        let mut values = DMatrix::zeros(steps, columns.len());
        let mut variables = Vec::with_capacity(columns.len());
        for (j, (name, column)) in columns.into_iter().enumerate() {
            if column.len() != steps {
                return Err(DaError::DimensionMismatch {
                    expected: steps,
                    actual: column.len(),
                    context: format!("column '{}'", name),
                });
            }
            for (t, v) in column.into_iter().enumerate() {
                values[(t, j)] = v;
            }
            variables.push(name);
        }
        Ok(Self { variables, values })
    }

    /// Table of `steps` rows with every entry set to `value`.
    pub fn filled(variables: Vec<String>, steps: usize, value: f64) -> Self {
        let n = variables.len();
        Self {
            variables,
            values: DMatrix::from_element(steps, n, value),
        }
    }

    /// Table with the given columns and no rows.
    pub fn empty(variables: Vec<String>) -> Self {
        Self::filled(variables, 0, 0.0)
    }

    /// Number of time steps (rows).
    #[inline]
    pub fn steps(&self) -> usize {
        self.values.nrows()
    }

    /// Number of variables (columns).
    #[inline]
    pub fn num_variables(&self) -> usize {
        self.values.ncols()
    }

    /// Column names.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Raw values.
    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    /// Mutable raw values.
    pub fn values_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.values
    }

    /// Column position of a variable.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v == name)
    }

    /// Copy of a column.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        self.column_index(name)
            .map(|j| self.values.column(j).iter().copied().collect())
    }

    /// Replace a column.
    pub fn set_column(&mut self, name: &str, data: &[f64]) -> DaResult<()> {
        let j = self
            .column_index(name)
            .ok_or_else(|| DaError::configuration(format!("unknown variable '{}'", name)))?;
        if data.len() != self.steps() {
            return Err(DaError::DimensionMismatch {
                expected: self.steps(),
                actual: data.len(),
                context: format!("column '{}'", name),
            });
        }
        for (t, &v) in data.iter().enumerate() {
            self.values[(t, j)] = v;
        }
        Ok(())
    }

    /// Rows `[start, end)` as a new table.
    pub fn slice(&self, start: usize, end: usize) -> DataTable {
        DataTable {
            variables: self.variables.clone(),
            values: self.values.rows(start, end - start).into_owned(),
        }
    }

    /// Rows covered by a window.
    pub fn window(&self, window: &AssimilationWindow) -> DataTable {
        self.slice(window.start, window.end)
    }

    /// Copy `block` into rows starting at `start`. Columns are matched by name.
    pub fn write_rows(&mut self, start: usize, block: &DataTable) -> DaResult<()> {
        if start + block.steps() > self.steps() {
            return Err(DaError::DimensionMismatch {
                expected: self.steps(),
                actual: start + block.steps(),
                context: "rows written to table".to_string(),
            });
        }
        for (jb, name) in block.variables.iter().enumerate() {
            if let Some(j) = self.column_index(name) {
                for t in 0..block.steps() {
                    self.values[(start + t, j)] = block.values[(t, jb)];
                }
            }
        }
        Ok(())
    }

    /// First non-finite entry as `(step, variable)`.
    pub fn first_non_finite(&self) -> Option<(usize, &str)> {
        for j in 0..self.num_variables() {
            for t in 0..self.steps() {
                if !self.values[(t, j)].is_finite() {
                    return Some((t, self.variables[j].as_str()));
                }
            }
        }
        None
    }

    /// Round every value through single precision.
    pub fn compact(&mut self) {
        self.values.apply(|v| *v = *v as f32 as f64);
    }
}

/// Observations and their error standard deviations on the run's time axis.
///
/// Missing observations are NaN; errors are defined wherever a value is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSeries {
    values: DataTable,
    errors: DataTable,
}

impl ObservationSeries {
    /// Pair values with errors, checking shapes and error availability.
    pub fn new(values: DataTable, errors: DataTable) -> DaResult<Self> {
        if values.steps() != errors.steps() || values.num_variables() != errors.num_variables() {
            return Err(DaError::DimensionMismatch {
                expected: values.steps() * values.num_variables(),
                actual: errors.steps() * errors.num_variables(),
                context: "observation errors".to_string(),
            });
        }
        for j in 0..values.num_variables() {
            for t in 0..values.steps() {
                let v = values.values()[(t, j)];
                let e = errors.values()[(t, j)];
                if v.is_finite() && !(e.is_finite() && e > 0.0) {
                    return Err(DaError::data_quality(format!(
                        "observation of '{}' at step {} has no valid error",
                        values.variables()[j],
                        t
                    )));
                }
            }
        }
        Ok(Self { values, errors })
    }

    /// Series with every value missing.
    pub fn missing(variables: Vec<String>, steps: usize) -> Self {
        Self {
            values: DataTable::filled(variables.clone(), steps, f64::NAN),
            errors: DataTable::filled(variables, steps, f64::NAN),
        }
    }

    /// Observed values (NaN where missing).
    pub fn values(&self) -> &DataTable {
        &self.values
    }

    /// Observation error standard deviations.
    pub fn errors(&self) -> &DataTable {
        &self.errors
    }

    /// Number of time steps.
    pub fn steps(&self) -> usize {
        self.values.steps()
    }

    /// Observed variable names.
    pub fn variables(&self) -> &[String] {
        self.values.variables()
    }

    /// Steps at which at least one variable is observed.
    pub fn observed_mask(&self) -> Vec<bool> {
        (0..self.steps())
            .map(|t| {
                (0..self.values.num_variables()).any(|j| self.values.values()[(t, j)].is_finite())
            })
            .collect()
    }

    /// Number of finite observation entries.
    pub fn valid_count(&self) -> usize {
        self.values.values().iter().filter(|v| v.is_finite()).count()
    }

    /// True when no observation is available.
    pub fn is_all_missing(&self) -> bool {
        self.valid_count() == 0
    }

    /// Observations inside a window.
    pub fn window(&self, window: &AssimilationWindow) -> ObservationSeries {
        ObservationSeries {
            values: self.values.window(window),
            errors: self.errors.window(window),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> DataTable {
        DataTable::from_columns(vec![
            ("Tair".to_string(), vec![270.0, 271.0, 272.0, 273.0]),
            ("Prec".to_string(), vec![1.0, 0.0, 2.0, 0.5]),
        ])
        .unwrap()
    }

    #[test]
    fn test_table_slice_and_columns() {
        let t = table();
        assert_eq!(t.steps(), 4);
        let w = t.window(&AssimilationWindow::new(0, 1, 3));
        assert_eq!(w.steps(), 2);
        assert_eq!(w.column("Prec").unwrap(), vec![0.0, 2.0]);
        assert!(t.column("missing").is_none());
    }

    #[test]
    fn test_write_rows_matches_by_name() {
        let mut target = DataTable::filled(vec!["Prec".into(), "Tair".into()], 4, f64::NAN);
        let block = table().slice(2, 4);
        target.write_rows(2, &block).unwrap();
        assert_eq!(target.column("Tair").unwrap()[3], 273.0);
        assert!(target.column("Prec").unwrap()[0].is_nan());
        assert!(target.write_rows(3, &block).is_err());
    }

    #[test]
    fn test_first_non_finite() {
        let mut t = table();
        assert!(t.first_non_finite().is_none());
        t.values_mut()[(2, 1)] = f64::NAN;
        assert_eq!(t.first_non_finite(), Some((2, "Prec")));
    }

    #[test]
    fn test_json_keeps_missing_values() {
        let mut t = table();
        t.values_mut()[(1, 0)] = f64::NAN;
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("null"));
        let back: DataTable = serde_json::from_str(&json).unwrap();
        assert!(back.values()[(1, 0)].is_nan());
        assert_eq!(back.column("Prec").unwrap(), t.column("Prec").unwrap());
    }

    #[test]
    fn test_json_rejects_infinity() {
        let mut t = table();
        t.values_mut()[(3, 1)] = f64::NEG_INFINITY;
        let err = serde_json::to_string(&t).unwrap_err();
        assert!(err.to_string().contains("Prec"));
    }

    #[test]
    fn test_json_single_precision_values_are_exact() {
        let values: Vec<f64> = (0..2000)
            .map(|i| (1.0 + i as f64 * 0.000_731).sqrt() as f32 as f64)
            .collect();
        let t = DataTable::from_columns(vec![("SWE".into(), values.clone())]).unwrap();
        let back: DataTable = serde_json::from_str(&serde_json::to_string(&t).unwrap()).unwrap();
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&back.column("SWE").unwrap()), bits(&values));
    }

    #[test]
    fn test_observation_series_validation() {
        let values = DataTable::from_columns(vec![("SWE".into(), vec![f64::NAN, 10.0])]).unwrap();
        let good = DataTable::from_columns(vec![("SWE".into(), vec![f64::NAN, 2.0])]).unwrap();
        let bad = DataTable::from_columns(vec![("SWE".into(), vec![1.0, f64::NAN])]).unwrap();

        let series = ObservationSeries::new(values.clone(), good).unwrap();
        assert_eq!(series.observed_mask(), vec![false, true]);
        assert_eq!(series.valid_count(), 1);
        assert!(ObservationSeries::new(values, bad).is_err());
        assert!(ObservationSeries::missing(vec!["SWE".into()], 3).is_all_missing());
    }
}
