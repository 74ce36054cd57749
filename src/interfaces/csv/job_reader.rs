use crate::domain::job::{JobRecord, RedemptionJob};
use crate::error::{PipelineError, Result};
use std::io::Read;

/// Reads due charges exported by the Job Source.
///
/// Wraps `csv::Reader` with whitespace trimming and flexible record lengths,
/// and yields one `Result<RedemptionJob>` per row so a bad row does not stop
/// the rest of the file.
pub struct JobReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> JobReader<R> {
    /// Creates a new `JobReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes and validates rows.
    pub fn jobs(self) -> impl Iterator<Item = Result<RedemptionJob>> {
        self.reader.into_deserialize().map(|result| {
            let record: JobRecord = result.map_err(PipelineError::from)?;
            RedemptionJob::try_from(record)
        })
    }
}
