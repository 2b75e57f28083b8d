use thiserror::Error;

/// Errors raised by the reconstruction and stitching pipeline.
///
/// Configuration problems are detected before any row processing starts and
/// are never silently defaulted. Row failures carry the failing output row
/// index plus the underlying cause so a large run can be diagnosed without
/// re-running it.
#[derive(Debug, Error)]
pub enum ReconError {
    /// Invalid or incomplete acquisition configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Dimension metadata is missing or does not describe physical coordinates.
    #[error("invalid dimension metadata: {0}")]
    InvalidDimension(String),

    /// Processing of a single output row failed; the whole run is aborted.
    #[error("output row {row} failed: {source}")]
    Row {
        row: usize,
        #[source]
        source: Box<ReconError>,
    },

    /// The sink reports a different number of completed rows than expected.
    /// Both the sink-reported count and the writer's own count are included
    /// to distinguish real data loss from a sink bug.
    #[error(
        "output volume incomplete: expected {expected} rows, sink reports {reported}, \
        writer recorded {written}; partial output retained for inspection"
    )]
    RowCountMismatch {
        expected: usize,
        reported: usize,
        written: usize,
    },

    /// Numerical or data-shape failure inside transform or accumulation.
    #[error("processing error: {0}")]
    Processing(String),

    /// The output sink rejected a write.
    #[error("sink error: {0}")]
    Sink(String),
}
