/*!
# Trace storage

Append-only storage for tallied samples. One save index covers every tracked
quantity: the sampler writes each quantity exactly once per tally, so all
series stay the same length; a halt truncates any partially written tally to
restore that invariant.

The save index is distinct from the raw iteration counter because burn-in
iterations are skipped and thinning keeps only every `thin`-th iteration.
*/

use std::collections::HashMap;
use std::ops::Range;

use ndarray::{Array1, Array2};

use crate::error::TraceError;
use crate::node::Value;

/// The contract the sampler holds its trace backend to.
pub trait TraceStorage {
    /// Appends one value for `name` at the current save index.
    fn write(&mut self, name: &str, value: Value);

    /// Reads a range of a quantity's series.
    fn read(&self, name: &str, range: Range<usize>) -> Result<Vec<Value>, TraceError>;

    /// Drops every sample at save index `len` and beyond, for all quantities.
    fn truncate(&mut self, len: usize);

    /// Number of complete tallies (the minimum series length).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracked quantity names, in registration order.
    fn names(&self) -> Vec<&str>;
}

/// In-memory trace backend.
#[derive(Debug, Default)]
pub struct MemoryTrace {
    order: Vec<String>,
    series: HashMap<String, Vec<Value>>,
}

impl MemoryTrace {
    pub fn new() -> Self {
        Self::default()
    }

    fn series(&self, name: &str) -> Result<&Vec<Value>, TraceError> {
        self.series
            .get(name)
            .ok_or_else(|| TraceError::UnknownQuantity(name.to_string()))
    }

    /// A scalar quantity's full series as an `f64` array. Fails if any
    /// sample has more than one element.
    pub fn as_f64(&self, name: &str) -> Result<Array1<f64>, TraceError> {
        let series = self.series(name)?;
        let mut out = Vec::with_capacity(series.len());
        for value in series {
            if value.len() != 1 {
                return Err(TraceError::NotNumeric(name.to_string()));
            }
            out.push(value.to_f64_vec()[0]);
        }
        Ok(Array1::from_vec(out))
    }

    /// A quantity's series as a draws × elements matrix. Every sample must
    /// have the same element count.
    pub fn as_array2(&self, name: &str) -> Result<Array2<f64>, TraceError> {
        let series = self.series(name)?;
        let rows = series.len();
        let cols = series.first().map(Value::len).unwrap_or(0);
        let mut flat = Vec::with_capacity(rows * cols);
        for value in series {
            if value.len() != cols {
                return Err(TraceError::NotNumeric(name.to_string()));
            }
            flat.extend(value.to_f64_vec());
        }
        Array2::from_shape_vec((rows, cols), flat)
            .map_err(|_| TraceError::NotNumeric(name.to_string()))
    }

    /// Errors unless every series has exactly `expected` samples.
    pub fn check_equal_lengths(&self, expected: usize) -> Result<(), TraceError> {
        for name in &self.order {
            let got = self.series[name].len();
            if got != expected {
                return Err(TraceError::LengthMismatch {
                    name: name.clone(),
                    expected,
                    got,
                });
            }
        }
        Ok(())
    }
}

impl TraceStorage for MemoryTrace {
    fn write(&mut self, name: &str, value: Value) {
        match self.series.get_mut(name) {
            Some(series) => series.push(value),
            None => {
                self.order.push(name.to_string());
                self.series.insert(name.to_string(), vec![value]);
            }
        }
    }

    fn read(&self, name: &str, range: Range<usize>) -> Result<Vec<Value>, TraceError> {
        let series = self.series(name)?;
        series
            .get(range.clone())
            .map(<[Value]>::to_vec)
            .ok_or_else(|| TraceError::LengthMismatch {
                name: name.to_string(),
                expected: range.end,
                got: series.len(),
            })
    }

    fn truncate(&mut self, len: usize) {
        for series in self.series.values_mut() {
            series.truncate(len);
        }
    }

    fn len(&self) -> usize {
        self.order
            .iter()
            .map(|name| self.series[name].len())
            .min()
            .unwrap_or(0)
    }

    fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }
}

/**
Saves a trace as a CSV file in long format. Enable via the `csv` feature.

Each row is one element of one tallied sample: the header is
`quantity,sample,elem,value`, with `sample` the save index and `elem` the
element offset within array-valued quantities (0 for scalars).
*/
#[cfg(feature = "csv")]
pub fn save_csv(trace: &MemoryTrace, filename: &str) -> Result<(), Box<dyn std::error::Error>> {
    use csv::Writer;
    use std::fs::File;

    let mut wtr = Writer::from_writer(File::create(filename)?);
    wtr.write_record(["quantity", "sample", "elem", "value"])?;

    for name in trace.names() {
        let series = trace.read(name, 0..TraceStorage::len(trace))?;
        for (sample_idx, value) in series.iter().enumerate() {
            for (elem, x) in value.to_f64_vec().into_iter().enumerate() {
                wtr.write_record([
                    name.to_string(),
                    sample_idx.to_string(),
                    elem.to_string(),
                    x.to_string(),
                ])?;
            }
        }
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn write_then_read() {
        let mut trace = MemoryTrace::new();
        trace.write("x", Value::F64(1.0));
        trace.write("x", Value::F64(2.0));
        let read = trace.read("x", 0..2).unwrap();
        assert_eq!(read, vec![Value::F64(1.0), Value::F64(2.0)]);
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn unknown_quantity_errors() {
        let trace = MemoryTrace::new();
        let err = trace.read("ghost", 0..1).unwrap_err();
        assert!(matches!(err, TraceError::UnknownQuantity(name) if name == "ghost"));
    }

    #[test]
    fn out_of_range_read_errors() {
        let mut trace = MemoryTrace::new();
        trace.write("x", Value::F64(1.0));
        assert!(trace.read("x", 0..5).is_err());
    }

    #[test]
    fn truncate_restores_equal_lengths() {
        let mut trace = MemoryTrace::new();
        trace.write("x", Value::F64(1.0));
        trace.write("y", Value::F64(10.0));
        // A partial tally: x written, y not.
        trace.write("x", Value::F64(2.0));
        assert!(trace.check_equal_lengths(2).is_err());
        trace.truncate(1);
        trace.check_equal_lengths(1).unwrap();
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn names_keep_registration_order() {
        let mut trace = MemoryTrace::new();
        trace.write("zeta", Value::F64(0.0));
        trace.write("alpha", Value::F64(0.0));
        assert_eq!(trace.names(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn scalar_series_to_array() {
        let mut trace = MemoryTrace::new();
        trace.write("n", Value::I64(3));
        trace.write("n", Value::I64(5));
        let arr = trace.as_f64("n").unwrap();
        assert_eq!(arr, arr1(&[3.0, 5.0]));
    }

    #[test]
    fn array_series_to_matrix() {
        let mut trace = MemoryTrace::new();
        trace.write("v", Value::ArrF64(arr1(&[1.0, 2.0])));
        trace.write("v", Value::ArrF64(arr1(&[3.0, 4.0])));
        let mat = trace.as_array2("v").unwrap();
        assert_eq!(mat.shape(), &[2, 2]);
        assert_eq!(mat[(1, 0)], 3.0);
        // A scalar accessor on an array series is an error, not a guess.
        assert!(trace.as_f64("v").is_err());
    }

    #[cfg(feature = "csv")]
    #[test]
    fn csv_round_trip_layout() {
        use std::fs;
        let mut trace = MemoryTrace::new();
        trace.write("x", Value::F64(1.5));
        trace.write("v", Value::ArrF64(arr1(&[2.0, 3.0])));
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        save_csv(&trace, path).unwrap();
        let contents = fs::read_to_string(path).unwrap();
        let expected = "\
quantity,sample,elem,value
x,0,0,1.5
v,0,0,2
v,0,1,3";
        assert_eq!(contents.trim(), expected);
    }
}
