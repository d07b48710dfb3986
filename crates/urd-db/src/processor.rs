use std::collections::BTreeMap;
use std::io::Write;

use urd_types::{Series, TimePrecision, UrdError};

use crate::wire::{serialize_series, to_json};

/// Consumer of query results, one series chunk at a time.
///
/// `yield_series` returning `Ok(false)` or an error tells the producer to
/// stop; `close` finalizes whatever output the processor buffered.
pub trait Processor: Send {
    fn name(&self) -> &'static str;

    fn yield_series(&mut self, series: Series) -> Result<bool, UrdError>;

    fn close(&mut self) -> Result<(), UrdError>;
}

fn write_err(e: std::io::Error) -> UrdError {
    UrdError::Transport(format!("response write failed: {e}"))
}

/// Merges chunks by series name and writes one JSON array on `close`,
/// sorted by name.
pub struct PointsWriter<W> {
    series: BTreeMap<String, Series>,
    out: W,
    precision: TimePrecision,
    pretty: bool,
}

impl<W: Write + Send> PointsWriter<W> {
    pub fn new(out: W, precision: TimePrecision, pretty: bool) -> Self {
        PointsWriter { series: BTreeMap::new(), out, precision, pretty }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Processor for PointsWriter<W> {
    fn name(&self) -> &'static str {
        "PointsWriter"
    }

    fn yield_series(&mut self, series: Series) -> Result<bool, UrdError> {
        match self.series.get_mut(&series.name) {
            Some(existing) => existing.merge(series)?,
            None => {
                self.series.insert(series.name.clone(), series);
            }
        }
        Ok(true)
    }

    fn close(&mut self) -> Result<(), UrdError> {
        let body = to_json(&serialize_series(self.series.values(), self.precision), self.pretty)?;
        self.out.write_all(&body).map_err(write_err)?;
        self.out.flush().map_err(write_err)
    }
}

/// Writes and flushes every chunk as soon as it is yielded. Each chunk is a
/// one-element JSON array.
pub struct ChunkWriter<W> {
    out: W,
    precision: TimePrecision,
    pretty: bool,
}

impl<W: Write + Send> ChunkWriter<W> {
    pub fn new(out: W, precision: TimePrecision, pretty: bool) -> Self {
        ChunkWriter { out, precision, pretty }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Processor for ChunkWriter<W> {
    fn name(&self) -> &'static str {
        "ChunkWriter"
    }

    fn yield_series(&mut self, series: Series) -> Result<bool, UrdError> {
        let body = to_json(&serialize_series([&series], self.precision), self.pretty)?;
        self.out.write_all(&body).map_err(write_err)?;
        self.out.flush().map_err(write_err)?;
        Ok(true)
    }

    fn close(&mut self) -> Result<(), UrdError> {
        Ok(())
    }
}

/// Keeps yielded chunks in memory, optionally stopping after `limit` of
/// them.
#[derive(Debug, Default)]
pub struct Collector {
    pub series: Vec<Series>,
    limit: Option<usize>,
    closed: bool,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Collector { limit: Some(limit), ..Self::default() }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Processor for Collector {
    fn name(&self) -> &'static str {
        "Collector"
    }

    fn yield_series(&mut self, series: Series) -> Result<bool, UrdError> {
        self.series.push(series);
        Ok(self.limit.map_or(true, |l| self.series.len() < l))
    }

    fn close(&mut self) -> Result<(), UrdError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use urd_types::{FieldValue, Point};

    use super::*;

    fn chunk(name: &str, t: i64, v: i64) -> Series {
        let mut s = Series::new(name, vec!["v".into()]);
        s.points.push(Point::new(t, vec![FieldValue::Int(v)]));
        s
    }

    #[test]
    fn points_writer_merges_and_writes_on_close() {
        let mut p = PointsWriter::new(Vec::new(), TimePrecision::Microsecond, false);
        assert!(p.yield_series(chunk("mem", 1, 1)).unwrap());
        assert!(p.yield_series(chunk("cpu", 2, 2)).unwrap());
        assert!(p.yield_series(chunk("cpu", 3, 3)).unwrap());
        assert!(p.out.is_empty());

        p.close().unwrap();
        let out: Value = serde_json::from_slice(&p.into_inner()).unwrap();
        assert_eq!(
            out,
            json!([
                {"name": "cpu", "columns": ["time", "v"], "points": [[2, 2], [3, 3]]},
                {"name": "mem", "columns": ["time", "v"], "points": [[1, 1]]}
            ])
        );
    }

    #[test]
    fn points_writer_rejects_column_mismatch() {
        let mut p = PointsWriter::new(Vec::new(), TimePrecision::Microsecond, false);
        p.yield_series(chunk("cpu", 1, 1)).unwrap();
        let mut other = chunk("cpu", 2, 2);
        other.fields = vec!["w".into()];
        assert_eq!(p.yield_series(other), Err(UrdError::ColumnMismatch("cpu".into())));
    }

    #[test]
    fn chunk_writer_flushes_each_series() {
        let mut p = ChunkWriter::new(Vec::new(), TimePrecision::Second, false);
        p.yield_series(chunk("cpu", 2_000_000, 1)).unwrap();
        let first = p.out.len();
        assert!(first > 0);
        p.yield_series(chunk("cpu", 3_000_000, 2)).unwrap();
        p.close().unwrap();

        let out = p.into_inner();
        let a: Value = serde_json::from_slice(&out[..first]).unwrap();
        assert_eq!(a[0]["points"], json!([[2, 1]]));
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn chunk_writer_reports_write_failure() {
        let mut p = ChunkWriter::new(Broken, TimePrecision::Microsecond, false);
        assert!(matches!(p.yield_series(chunk("cpu", 1, 1)), Err(UrdError::Transport(_))));
    }

    #[test]
    fn collector_stops_at_limit() {
        let mut c = Collector::with_limit(2);
        assert!(c.yield_series(chunk("a", 1, 1)).unwrap());
        assert!(!c.yield_series(chunk("b", 1, 1)).unwrap());
    }
}
