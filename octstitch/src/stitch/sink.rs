use std::sync::Mutex;

use octcore::data::dimension::DimensionSet;
use octcore::data::frame::{MaskedPlane, Volume};
use octcore::error::ReconError;

/// Streaming destination of the stitched volume, written one y row at a
/// time. Implementations must accept concurrent `write_row` calls for
/// distinct indices and idempotent rewrites of the same index; no two
/// workers ever write the same row.
pub trait VolumeSink: Send + Sync {
    /// Number of rows the sink was sized for.
    fn expected_rows(&self) -> usize;

    /// Stores one `(z, x)` row at `y_index`. Rewriting an index with
    /// identical data must leave the final output unchanged.
    fn write_row(&self, y_index: usize, row: &MaskedPlane) -> Result<(), ReconError>;

    /// Persists the dimension metadata once all rows are written.
    fn finalize(&self, dims: &DimensionSet) -> Result<(), ReconError>;

    /// Rows actually present, counted by the sink itself. Used for the
    /// post-run consistency check.
    fn completed_rows(&self) -> usize;
}

/// Row table held in memory behind a mutex. Serves tests and small
/// volumes; the streamed file container lives outside this crate.
pub struct MemoryVolumeSink {
    expected: usize,
    rows: Mutex<Vec<Option<MaskedPlane>>>,
    metadata_json: Mutex<Option<String>>,
}

impl MemoryVolumeSink {
    pub fn new(expected_rows: usize) -> Self {
        MemoryVolumeSink {
            expected: expected_rows,
            rows: Mutex::new(vec![None; expected_rows]),
            metadata_json: Mutex::new(None),
        }
    }

    /// Dimension metadata captured at finalize, as JSON.
    pub fn metadata_json(&self) -> Option<String> {
        self.metadata_json.lock().unwrap().clone()
    }

    /// One stored row, if present.
    pub fn row(&self, y_index: usize) -> Option<MaskedPlane> {
        self.rows.lock().unwrap().get(y_index).cloned().flatten()
    }

    /// Assembles the stored rows into a dense `(z, x, y)` volume.
    /// Undefined pixels become `fill`. Fails while rows are missing.
    pub fn to_volume(&self, fill: f64) -> Result<Volume, ReconError> {
        let rows = self.rows.lock().unwrap();
        let first = rows
            .iter()
            .flatten()
            .next()
            .ok_or_else(|| ReconError::Sink("no rows written".to_string()))?;
        let (n_z, n_x) = (first.rows, first.cols);
        let mut volume = Volume::zeros(n_z, n_x, self.expected);
        for (i_y, slot) in rows.iter().enumerate() {
            let row = slot
                .as_ref()
                .ok_or_else(|| ReconError::Sink(format!("row {} missing", i_y)))?;
            for i_z in 0..n_z {
                for i_x in 0..n_x {
                    volume.set(i_z, i_x, i_y, row.get(i_z, i_x).unwrap_or(fill));
                }
            }
        }
        Ok(volume)
    }
}

impl VolumeSink for MemoryVolumeSink {
    fn expected_rows(&self) -> usize {
        self.expected
    }

    fn write_row(&self, y_index: usize, row: &MaskedPlane) -> Result<(), ReconError> {
        let mut rows = self.rows.lock().unwrap();
        if y_index >= rows.len() {
            return Err(ReconError::Sink(format!(
                "row index {} out of range, sink sized for {} rows",
                y_index,
                rows.len()
            )));
        }
        if let Some(existing) = &rows[y_index] {
            if (existing.rows, existing.cols) != (row.rows, row.cols) {
                return Err(ReconError::Sink(format!(
                    "row {} rewritten with different shape: {}x{} vs {}x{}",
                    y_index, row.rows, row.cols, existing.rows, existing.cols
                )));
            }
        }
        rows[y_index] = Some(row.clone());
        Ok(())
    }

    fn finalize(&self, dims: &DimensionSet) -> Result<(), ReconError> {
        let json = serde_json::to_string(dims)
            .map_err(|e| ReconError::Sink(format!("dimension metadata serialization: {}", e)))?;
        *self.metadata_json.lock().unwrap() = Some(json);
        Ok(())
    }

    fn completed_rows(&self) -> usize {
        self.rows.lock().unwrap().iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octcore::data::dimension::{AxisUnits, DimensionAxis};

    fn small_row(value: f64) -> MaskedPlane {
        let mut row = MaskedPlane::undefined(2, 2);
        row.set(0, 0, value);
        row
    }

    #[test]
    fn test_row_accounting() {
        let sink = MemoryVolumeSink::new(3);
        assert_eq!(sink.completed_rows(), 0);
        sink.write_row(1, &small_row(1.0)).unwrap();
        assert_eq!(sink.completed_rows(), 1);
        sink.write_row(0, &small_row(2.0)).unwrap();
        sink.write_row(2, &small_row(3.0)).unwrap();
        assert_eq!(sink.completed_rows(), 3);
    }

    #[test]
    fn test_idempotent_rewrite() {
        let sink = MemoryVolumeSink::new(2);
        let row = small_row(5.0);
        sink.write_row(0, &row).unwrap();
        sink.write_row(0, &row).unwrap();
        assert_eq!(sink.completed_rows(), 1);
        assert_eq!(sink.row(0).unwrap(), row);
    }

    #[test]
    fn test_out_of_range_write_rejected() {
        let sink = MemoryVolumeSink::new(1);
        assert!(sink.write_row(5, &small_row(0.0)).is_err());
    }

    #[test]
    fn test_finalize_captures_metadata() {
        let sink = MemoryVolumeSink::new(1);
        let axis = |n: usize| {
            DimensionAxis::new((0..n).map(|i| i as f64).collect(), AxisUnits::Millimeters, "test")
        };
        let dims = DimensionSet::new(axis(2), axis(1), axis(2));
        sink.finalize(&dims).unwrap();
        let json = sink.metadata_json().unwrap();
        assert!(json.contains("Millimeters"));
    }

    #[test]
    fn test_to_volume_requires_all_rows() {
        let sink = MemoryVolumeSink::new(2);
        sink.write_row(0, &small_row(1.0)).unwrap();
        assert!(sink.to_volume(0.0).is_err());
        sink.write_row(1, &small_row(2.0)).unwrap();
        let volume = sink.to_volume(-1.0).unwrap();
        assert_eq!(volume.at(0, 0, 0), 1.0);
        // Undefined pixels take the fill value
        assert_eq!(volume.at(1, 1, 0), -1.0);
    }
}
