use urd_types::{Series, SeriesPattern};

/// Which series a query reads.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SeriesSelector {
    Name(String),
    Regex(SeriesPattern),
}

impl SeriesSelector {
    pub fn matches(&self, series: &str) -> bool {
        match self {
            SeriesSelector::Name(name) => name == series,
            SeriesSelector::Regex(pattern) => pattern.matches(series),
        }
    }
}

/// An already parsed query: a series selector, the fields to return (empty
/// for all), a half-open time range in microseconds and an optional limit
/// on points per series.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Query {
    pub series: SeriesSelector,
    pub fields: Vec<String>,
    pub start: i64,
    pub end: i64,
    pub limit: Option<usize>,
}

impl Query {
    /// All fields of the series `name` over all time.
    pub fn select(name: impl Into<String>) -> Self {
        Query {
            series: SeriesSelector::Name(name.into()),
            fields: Vec::new(),
            start: i64::MIN,
            end: i64::MAX,
            limit: None,
        }
    }

    pub fn matching(pattern: SeriesPattern) -> Self {
        Query { series: SeriesSelector::Regex(pattern), ..Self::select("") }
    }

    pub fn fields<I, F>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn between(mut self, start: i64, end: i64) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn in_range(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp < self.end
    }

    /// Applies the selector, time range and field projection to one stored
    /// chunk. `None` when nothing of it is selected.
    pub fn filter(&self, series: &Series) -> Option<Series> {
        if !self.series.matches(&series.name) {
            return None;
        }
        let mut out = series.project(&self.fields)?;
        out.points.retain(|p| p.timestamp.is_some_and(|t| self.in_range(t)));
        if out.points.is_empty() {
            return None;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use urd_types::{FieldValue, Point};

    use super::*;

    #[test]
    fn filter_applies_range_and_projection() {
        let mut s = Series::new("cpu_load", vec!["a".into(), "b".into()]);
        for t in [5, 10, 15] {
            s.points.push(Point::new(t, vec![FieldValue::Int(t), FieldValue::Bool(true)]));
        }
        let q = Query::select("cpu_load").fields(["a"]).between(10, 20);
        let out = q.filter(&s).unwrap();
        assert_eq!(out.fields, vec!["a"]);
        assert_eq!(out.points.iter().map(|p| p.timestamp).collect::<Vec<_>>(), vec![Some(10), Some(15)]);

        assert!(Query::select("mem").filter(&s).is_none());
        assert!(Query::select("cpu_load").between(100, 200).filter(&s).is_none());
        let by_pattern = Query::matching(SeriesPattern::new("^cpu").unwrap());
        assert!(by_pattern.filter(&s).is_some());
    }
}
