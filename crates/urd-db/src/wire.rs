//! JSON shape of series on the client boundary:
//! `{"name": .., "columns": [..], "points": [[..], ..]}`.
//!
//! Ingress turns each record into a typed [`Series`]; egress renders a
//! series back with `time` (and `sequence_number` when present) as leading
//! columns.

use serde_json::Value;
use tracing::warn;

use urd_types::{FieldValue, Point, Series, TimePrecision, UrdError};

const TIME: &str = "time";
const SEQUENCE_NUMBER: &str = "sequence_number";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SerializedSeries {
    pub name: String,
    pub columns: Vec<String>,
    pub points: Vec<Vec<Value>>,
}

impl SerializedSeries {
    /// Builds the typed series, converting `time` from `precision` to
    /// microseconds.
    pub fn into_series(self, precision: TimePrecision) -> Result<Series, UrdError> {
        let mut seen = std::collections::HashSet::with_capacity(self.columns.len());
        if let Some(dup) = self.columns.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(UrdError::InvalidPayload(format!("duplicate column '{dup}'")));
        }

        let mut points = Vec::with_capacity(self.points.len());
        for row in self.points {
            if row.len() != self.columns.len() {
                return Err(UrdError::InvalidPayload(format!(
                    "row has {} values for {} columns",
                    row.len(),
                    self.columns.len()
                )));
            }
            let mut point = Point { timestamp: None, sequence_number: None, values: Vec::new() };
            for (column, value) in self.columns.iter().zip(row) {
                match column.as_str() {
                    TIME => point.timestamp = Some(precision.to_micros(parse_time(&value)?)?),
                    SEQUENCE_NUMBER => point.sequence_number = Some(parse_sequence(&value)?),
                    _ => point.values.push(parse_value(column, value)?),
                }
            }
            points.push(point);
        }

        let fields = self
            .columns
            .into_iter()
            .filter(|c| c != TIME && c != SEQUENCE_NUMBER)
            .collect();
        let series = Series { name: self.name, fields, points };
        series.validate()?;
        Ok(series)
    }

    /// Renders `series` with timestamps in `precision`. Non-finite doubles
    /// become `null`.
    pub fn from_series(series: &Series, precision: TimePrecision) -> Self {
        let with_sequence = series.has_sequence_numbers();
        let points = series
            .points
            .iter()
            .map(|p| {
                let mut row = Vec::with_capacity(p.values.len() + 2);
                row.push(Value::from(precision.from_micros(p.timestamp.unwrap_or(0))));
                if with_sequence {
                    row.push(Value::from(p.sequence_number.unwrap_or(0)));
                }
                row.extend(p.values.iter().map(|v| render_value(&series.name, v)));
                row
            })
            .collect();
        SerializedSeries { name: series.name.clone(), columns: series.columns(), points }
    }
}

fn parse_time(value: &Value) -> Result<i64, UrdError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
                    .map(|f| f as i64)
            })
            .ok_or_else(|| UrdError::InvalidPayload(format!("time out of range: {n}"))),
        other => Err(UrdError::InvalidPayload(format!("time must be a number, got {other}"))),
    }
}

fn parse_sequence(value: &Value) -> Result<u64, UrdError> {
    let bad = || UrdError::InvalidPayload(format!("sequence_number must be unsigned, got {value}"));
    match value {
        Value::Number(n) => match n.as_u64() {
            Some(v) => Ok(v),
            None => match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(f as u64),
                _ => Err(bad()),
            },
        },
        _ => Err(bad()),
    }
}

fn parse_value(column: &str, value: Value) -> Result<FieldValue, UrdError> {
    Ok(match value {
        Value::String(s) => FieldValue::String(s),
        Value::Bool(b) => FieldValue::Bool(b),
        Value::Null => FieldValue::Null,
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => FieldValue::Double(n.as_f64().ok_or_else(|| {
                UrdError::InvalidPayload(format!("column '{column}': number out of range"))
            })?),
        },
        other => {
            return Err(UrdError::InvalidPayload(format!(
                "column '{column}': unsupported value {other}"
            )))
        }
    })
}

fn render_value(series: &str, value: &FieldValue) -> Value {
    match value {
        FieldValue::String(s) => Value::from(s.as_str()),
        FieldValue::Int(i) => Value::from(*i),
        FieldValue::Bool(b) => Value::from(*b),
        FieldValue::Null => Value::Null,
        FieldValue::Double(d) => match serde_json::Number::from_f64(*d) {
            Some(n) => Value::Number(n),
            None => {
                warn!(series, value = %d, "non-finite value rendered as null");
                Value::Null
            }
        },
    }
}

/// Parses a write payload: a JSON array of serialized series.
pub fn parse_payload(bytes: &[u8], precision: TimePrecision) -> Result<Vec<Series>, UrdError> {
    let records: Vec<SerializedSeries> = serde_json::from_slice(bytes)
        .map_err(|e| UrdError::InvalidPayload(e.to_string()))?;
    records.into_iter().map(|r| r.into_series(precision)).collect()
}

/// Renders `series` sorted by name.
pub fn serialize_series<'a>(
    series: impl IntoIterator<Item = &'a Series>,
    precision: TimePrecision,
) -> Vec<SerializedSeries> {
    let mut out: Vec<SerializedSeries> =
        series.into_iter().map(|s| SerializedSeries::from_series(s, precision)).collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

/// JSON bytes of `value`, indented by four spaces when `pretty`.
pub fn to_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<Vec<u8>, UrdError> {
    let mut buf = Vec::new();
    let res = if pretty {
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        value.serialize(&mut ser)
    } else {
        serde_json::to_writer(&mut buf, value)
    };
    res.map_err(|e| UrdError::InvalidArgument(format!("serialize: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(v: Value, precision: TimePrecision) -> Result<Vec<Series>, UrdError> {
        parse_payload(v.to_string().as_bytes(), precision)
    }

    #[test]
    fn ingress_types_values_and_scales_time() {
        let series = parse(
            json!([{
                "name": "cpu",
                "columns": ["time", "sequence_number", "host", "load", "ratio", "up", "note"],
                "points": [[12, 3, "a", 100, 0.5, true, null]]
            }]),
            TimePrecision::Second,
        )
        .unwrap();
        let s = &series[0];
        assert_eq!(s.fields, vec!["host", "load", "ratio", "up", "note"]);
        let p = &s.points[0];
        assert_eq!(p.timestamp, Some(12_000_000));
        assert_eq!(p.sequence_number, Some(3));
        assert_eq!(
            p.values,
            vec![
                FieldValue::String("a".into()),
                FieldValue::Int(100),
                FieldValue::Double(0.5),
                FieldValue::Bool(true),
                FieldValue::Null,
            ]
        );
    }

    #[test]
    fn time_column_is_optional() {
        let series = parse(
            json!([{"name": "m", "columns": ["v"], "points": [[1]]}]),
            TimePrecision::Microsecond,
        )
        .unwrap();
        assert_eq!(series[0].points[0].timestamp, None);
    }

    #[test]
    fn ingress_rejects_bad_payloads() {
        let cases = [
            json!([{"name": "m", "columns": ["v", "v"], "points": [[1, 2]]}]),
            json!([{"name": "m", "columns": ["time", "v"], "points": [[1]]}]),
            json!([{"name": "m", "columns": ["time", "v"], "points": [["now", 1]]}]),
            json!([{"name": "m", "columns": ["sequence_number", "v"], "points": [[-1, 1]]}]),
            json!([{"name": "m", "columns": ["v"], "points": [[[1, 2]]]}]),
            json!({"name": "m"}),
        ];
        for case in cases {
            assert!(
                matches!(parse(case.clone(), TimePrecision::Microsecond), Err(UrdError::InvalidPayload(_))),
                "{case} accepted"
            );
        }
    }

    #[test]
    fn ingress_rejects_unrepresentable_times() {
        let payload = |time: Value| json!([{"name": "m", "columns": ["time", "v"], "points": [[time, 1]]}]);
        for (time, precision) in [
            (json!(-1e13), TimePrecision::Second),
            (json!(i64::MAX), TimePrecision::Millisecond),
            (json!(1e300), TimePrecision::Microsecond),
        ] {
            assert!(
                matches!(parse(payload(time.clone()), precision), Err(UrdError::InvalidPayload(_))),
                "accepted time {time} at {precision:?}"
            );
        }
        let edge = parse(payload(json!(i64::MIN)), TimePrecision::Microsecond).unwrap();
        assert_eq!(edge[0].points[0].timestamp, Some(i64::MIN));
    }

    #[test]
    fn egress_scales_time_and_nulls_non_finite() {
        let mut s = Series::new("cpu", vec!["v".into()]);
        s.points.push(Point::new(2_500_000, vec![FieldValue::Double(f64::NAN)]));
        s.points.push(Point::new(3_000_000, vec![FieldValue::Int(7)]));

        let out = SerializedSeries::from_series(&s, TimePrecision::Millisecond);
        assert_eq!(out.columns, vec!["time", "v"]);
        assert_eq!(out.points, vec![vec![json!(2500), Value::Null], vec![json!(3000), json!(7)]]);

        let secs = SerializedSeries::from_series(&s, TimePrecision::Second);
        assert_eq!(secs.points[0][0], json!(2));
    }

    #[test]
    fn egress_sequence_number_column_follows_first_point() {
        let mut s = Series::new("cpu", vec!["v".into()]);
        s.points.push(Point { timestamp: Some(1), sequence_number: Some(9), values: vec![FieldValue::Int(1)] });
        let out = SerializedSeries::from_series(&s, TimePrecision::Microsecond);
        assert_eq!(out.columns, vec!["time", "sequence_number", "v"]);
        assert_eq!(out.points[0], vec![json!(1), json!(9), json!(1)]);
    }

    #[test]
    fn pretty_output_uses_four_spaces() {
        let bytes = to_json(&json!({"a": 1}), true).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "{\n    \"a\": 1\n}");
        assert_eq!(to_json(&json!({"a": 1}), false).unwrap(), b"{\"a\":1}");
    }
}
