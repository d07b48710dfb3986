use std::collections::HashSet;

use crate::UrdError;

/// One typed column value. Decided once when a payload is parsed; nothing
/// past ingress carries an untyped value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum FieldValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Null,
}

impl FieldValue {
    /// `false` only for NaN / infinite doubles.
    pub fn is_finite(&self) -> bool {
        match self {
            FieldValue::Double(v) => v.is_finite(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Point {
    /// Microseconds since the Unix epoch.
    pub timestamp: Option<i64>,
    pub sequence_number: Option<u64>,
    pub values: Vec<FieldValue>,
}

impl Point {
    pub fn new(timestamp: i64, values: Vec<FieldValue>) -> Self {
        Point { timestamp: Some(timestamp), sequence_number: None, values }
    }
}

/// A named run of points sharing one ordered field list.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Series {
    pub name: String,
    pub fields: Vec<String>,
    pub points: Vec<Point>,
}

impl Series {
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Series { name: name.into(), fields, points: Vec::new() }
    }

    /// Checks the structural invariants: a name, unique field names and one
    /// value per field in every point.
    pub fn validate(&self) -> Result<(), UrdError> {
        if self.name.is_empty() {
            return Err(UrdError::InvalidPayload("series name required".into()));
        }
        let mut seen = HashSet::with_capacity(self.fields.len());
        for field in &self.fields {
            if !seen.insert(field.as_str()) {
                return Err(UrdError::InvalidPayload(format!(
                    "duplicate field name '{field}'"
                )));
            }
        }
        for point in &self.points {
            if point.values.len() != self.fields.len() {
                return Err(UrdError::InvalidPayload(format!(
                    "point has {} values for {} fields",
                    point.values.len(),
                    self.fields.len()
                )));
            }
        }
        Ok(())
    }

    /// Whether the `sequence_number` column is present. Decided by the first
    /// point, the same way the egress format decides it.
    pub fn has_sequence_numbers(&self) -> bool {
        self.points.first().map(|p| p.sequence_number.is_some()).unwrap_or(false)
    }

    /// Output columns: `time`, optionally `sequence_number`, then the fields.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = Vec::with_capacity(self.fields.len() + 2);
        columns.push("time".to_string());
        if self.has_sequence_numbers() {
            columns.push("sequence_number".to_string());
        }
        columns.extend(self.fields.iter().cloned());
        columns
    }

    /// Appends the points of `other`, which must carry the same name and
    /// columns. Empty chunks are compatible with anything of the same name.
    pub fn merge(&mut self, other: Series) -> Result<(), UrdError> {
        if other.name != self.name {
            return Err(UrdError::ColumnMismatch(other.name));
        }
        if self.points.is_empty() && self.fields.is_empty() {
            *self = other;
            return Ok(());
        }
        if other.points.is_empty() && other.fields == self.fields {
            return Ok(());
        }
        let same_columns = if self.points.is_empty() || other.points.is_empty() {
            self.fields == other.fields
        } else {
            self.columns() == other.columns()
        };
        if !same_columns {
            return Err(UrdError::ColumnMismatch(self.name.clone()));
        }
        self.points.extend(other.points);
        Ok(())
    }

    /// Restricts the series to `fields`, in the requested order. An empty
    /// list or `*` keeps every field. Returns `None` when none of the
    /// requested fields exist in this series.
    pub fn project(&self, fields: &[String]) -> Option<Series> {
        if fields.is_empty() || fields.iter().any(|f| f == "*") {
            return Some(self.clone());
        }
        let indices: Vec<(usize, &String)> = fields
            .iter()
            .filter_map(|f| self.fields.iter().position(|x| x == f).map(|i| (i, f)))
            .collect();
        if indices.is_empty() {
            return None;
        }
        let points = self
            .points
            .iter()
            .map(|p| Point {
                timestamp: p.timestamp,
                sequence_number: p.sequence_number,
                values: indices.iter().map(|(i, _)| p.values[*i].clone()).collect(),
            })
            .collect();
        Some(Series {
            name: self.name.clone(),
            fields: indices.into_iter().map(|(_, f)| f.clone()).collect(),
            points,
        })
    }
}

/// Unit of the `time` column on the wire. Internally timestamps are always
/// microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimePrecision {
    Second,
    Millisecond,
    #[default]
    Microsecond,
}

impl TimePrecision {
    /// Accepts the short (`s`, `m`, `u`) and long spellings; empty means the
    /// default (microseconds).
    pub fn parse(s: &str) -> Result<Self, UrdError> {
        match s {
            "" | "u" | "us" | "microsecond" => Ok(TimePrecision::Microsecond),
            "m" | "ms" | "millisecond" => Ok(TimePrecision::Millisecond),
            "s" | "second" => Ok(TimePrecision::Second),
            other => Err(UrdError::InvalidArgument(format!("unknown time precision '{other}'"))),
        }
    }

    /// Fails with `InvalidPayload` if `value` does not fit in microseconds.
    pub fn to_micros(self, value: i64) -> Result<i64, UrdError> {
        let micros = match self {
            TimePrecision::Second => value.checked_mul(1_000_000),
            TimePrecision::Millisecond => value.checked_mul(1_000),
            TimePrecision::Microsecond => Some(value),
        };
        micros.ok_or_else(|| UrdError::InvalidPayload(format!("timestamp {value} out of range")))
    }

    pub fn from_micros(self, micros: i64) -> i64 {
        match self {
            TimePrecision::Second => micros / 1_000_000,
            TimePrecision::Millisecond => micros / 1_000,
            TimePrecision::Microsecond => micros,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(points: Vec<Point>) -> Series {
        Series { name: "cpu".into(), fields: vec!["value".into()], points }
    }

    #[test]
    fn validate_rejects_duplicate_fields() {
        let s = Series::new("cpu", vec!["a".into(), "a".into()]);
        assert!(matches!(s.validate(), Err(UrdError::InvalidPayload(_))));
    }

    #[test]
    fn validate_rejects_short_rows() {
        let mut s = Series::new("cpu", vec!["a".into(), "b".into()]);
        s.points.push(Point::new(1, vec![FieldValue::Int(1)]));
        assert!(matches!(s.validate(), Err(UrdError::InvalidPayload(_))));
    }

    #[test]
    fn merge_concatenates_points() {
        let mut a = cpu(vec![Point::new(1, vec![FieldValue::Int(1)])]);
        let b = cpu(vec![Point::new(2, vec![FieldValue::Int(2)])]);
        a.merge(b).unwrap();
        assert_eq!(a.points.len(), 2);
        assert_eq!(a.points[1].timestamp, Some(2));
    }

    #[test]
    fn merge_rejects_column_mismatch() {
        let mut a = cpu(vec![Point::new(1, vec![FieldValue::Int(1)])]);
        let mut b = cpu(vec![Point::new(2, vec![FieldValue::Int(2)])]);
        b.fields = vec!["other".into()];
        assert_eq!(a.merge(b), Err(UrdError::ColumnMismatch("cpu".into())));

        let mut with_seq = cpu(vec![Point::new(3, vec![FieldValue::Int(3)])]);
        with_seq.points[0].sequence_number = Some(7);
        assert!(a.merge(with_seq).is_err());
    }

    #[test]
    fn columns_include_sequence_number_when_present() {
        let mut s = cpu(vec![Point::new(1, vec![FieldValue::Int(1)])]);
        assert_eq!(s.columns(), vec!["time", "value"]);
        s.points[0].sequence_number = Some(1);
        assert_eq!(s.columns(), vec!["time", "sequence_number", "value"]);
    }

    #[test]
    fn project_keeps_requested_order() {
        let s = Series {
            name: "cpu".into(),
            fields: vec!["a".into(), "b".into()],
            points: vec![Point::new(1, vec![FieldValue::Int(1), FieldValue::Int(2)])],
        };
        let p = s.project(&["b".into(), "a".into()]).unwrap();
        assert_eq!(p.fields, vec!["b", "a"]);
        assert_eq!(p.points[0].values, vec![FieldValue::Int(2), FieldValue::Int(1)]);
        assert!(s.project(&["missing".into()]).is_none());
        assert_eq!(s.project(&[]).unwrap(), s);
    }

    #[test]
    fn precision_conversions() {
        assert_eq!(TimePrecision::parse("").unwrap(), TimePrecision::Microsecond);
        assert_eq!(TimePrecision::parse("s").unwrap(), TimePrecision::Second);
        assert_eq!(TimePrecision::parse("ms").unwrap(), TimePrecision::Millisecond);
        assert!(TimePrecision::parse("h").is_err());

        assert_eq!(TimePrecision::Second.to_micros(2).unwrap(), 2_000_000);
        assert_eq!(TimePrecision::Millisecond.to_micros(2).unwrap(), 2_000);
        assert_eq!(TimePrecision::Microsecond.to_micros(i64::MIN).unwrap(), i64::MIN);
        assert!(matches!(
            TimePrecision::Second.to_micros(-10_000_000_000_000),
            Err(UrdError::InvalidPayload(_))
        ));
        assert!(TimePrecision::Millisecond.to_micros(i64::MAX).is_err());
        assert_eq!(TimePrecision::Second.from_micros(2_500_000), 2);
        assert_eq!(TimePrecision::Millisecond.from_micros(2_500_000), 2_500);
        assert_eq!(TimePrecision::Microsecond.from_micros(7), 7);
    }
}
