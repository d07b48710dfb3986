use tonic::metadata::MetadataValue;
use tonic::{Code, Status};

use urd_cluster::{AppendRequest, AppendResponse};
use urd_db::{Query, SeriesSelector};
use urd_proto::v1::{
    self as pb, field_value::Value as PbValue, query_spec::Selector, AppendEntriesRequest,
    AppendEntriesResponse, QuerySpec,
};
use urd_types::{ErrorKind, FieldValue, Point, Series, SeriesPattern, UrdError};

/// Metadata key carrying the current leader's address on `NotLeader`.
pub const LEADER_ADDR_HEADER: &str = "urd-leader-addr";

pub fn urd_to_status(err: UrdError) -> Status {
    let msg = err.to_string();
    match &err {
        UrdError::NotLeader { leader } => {
            let mut status = Status::unavailable(msg);
            if let Some(addr) = leader {
                if let Ok(val) = MetadataValue::try_from(addr.as_str()) {
                    status.metadata_mut().insert(LEADER_ADDR_HEADER, val);
                }
            }
            status
        }
        UrdError::DatabaseExists | UrdError::UserExists | UrdError::ShardSpaceExists | UrdError::ServerExists => {
            Status::already_exists(msg)
        }
        UrdError::PermissionDenied(_) => Status::permission_denied(msg),
        UrdError::InsufficientReplicas { .. } => Status::failed_precondition(msg),
        UrdError::QuorumNotReached { .. } | UrdError::Transport(_) => Status::unavailable(msg),
        UrdError::Timeout => Status::deadline_exceeded(msg),
        _ => match err.kind() {
            ErrorKind::Framing => Status::data_loss(msg),
            ErrorKind::Validation => Status::invalid_argument(msg),
            ErrorKind::NotFound => Status::not_found(msg),
            ErrorKind::Consistency => Status::aborted(msg),
            ErrorKind::NotLeader | ErrorKind::Unavailable => Status::unavailable(msg),
            ErrorKind::Internal => Status::internal(msg),
        },
    }
}

/// Error seen by the calling side of an RPC.
pub fn status_to_urd(status: Status) -> UrdError {
    if let Some(addr) = status.metadata().get(LEADER_ADDR_HEADER) {
        return UrdError::NotLeader { leader: addr.to_str().ok().map(str::to_owned) };
    }
    match status.code() {
        Code::DeadlineExceeded => UrdError::Timeout,
        Code::DataLoss => UrdError::Framing(status.message().to_owned()),
        code => UrdError::Transport(format!("{code:?}: {}", status.message())),
    }
}

// -- series ------------------------------------------------------------------

fn value_to_proto(value: FieldValue) -> pb::FieldValue {
    let value = match value {
        FieldValue::String(s) => Some(PbValue::StringValue(s)),
        FieldValue::Int(i) => Some(PbValue::Int64Value(i)),
        FieldValue::Double(d) => Some(PbValue::DoubleValue(d)),
        FieldValue::Bool(b) => Some(PbValue::BoolValue(b)),
        FieldValue::Null => None,
    };
    pb::FieldValue { value }
}

fn value_from_proto(value: pb::FieldValue) -> FieldValue {
    match value.value {
        Some(PbValue::StringValue(s)) => FieldValue::String(s),
        Some(PbValue::Int64Value(i)) => FieldValue::Int(i),
        Some(PbValue::DoubleValue(d)) => FieldValue::Double(d),
        Some(PbValue::BoolValue(b)) => FieldValue::Bool(b),
        None => FieldValue::Null,
    }
}

pub fn series_to_proto(series: Series) -> pb::Series {
    pb::Series {
        name: series.name,
        fields: series.fields,
        points: series
            .points
            .into_iter()
            .map(|p| pb::Point {
                timestamp: p.timestamp,
                sequence_number: p.sequence_number,
                values: p.values.into_iter().map(value_to_proto).collect(),
            })
            .collect(),
    }
}

pub fn series_from_proto(series: pb::Series) -> Series {
    Series {
        name: series.name,
        fields: series.fields,
        points: series
            .points
            .into_iter()
            .map(|p| Point {
                timestamp: p.timestamp,
                sequence_number: p.sequence_number,
                values: p.values.into_iter().map(value_from_proto).collect(),
            })
            .collect(),
    }
}

// -- queries -----------------------------------------------------------------

pub fn query_to_proto(query: Query) -> QuerySpec {
    let selector = match query.series {
        SeriesSelector::Name(name) => Selector::Name(name),
        SeriesSelector::Regex(pattern) => Selector::Regex(pattern.as_str().to_owned()),
    };
    QuerySpec {
        selector: Some(selector),
        fields: query.fields,
        start: query.start,
        end: query.end,
        limit: query.limit.map(|l| l as u64),
    }
}

pub fn query_from_proto(spec: QuerySpec) -> Result<Query, UrdError> {
    let series = match spec.selector {
        Some(Selector::Name(name)) if !name.is_empty() => SeriesSelector::Name(name),
        Some(Selector::Regex(src)) => SeriesSelector::Regex(SeriesPattern::new(&src)?),
        _ => return Err(UrdError::InvalidArgument("query needs a series name or pattern".into())),
    };
    if spec.start >= spec.end {
        return Err(UrdError::InvalidArgument(format!(
            "empty time range [{}, {})",
            spec.start, spec.end
        )));
    }
    Ok(Query {
        series,
        fields: spec.fields,
        start: spec.start,
        end: spec.end,
        limit: spec.limit.map(|l| usize::try_from(l).unwrap_or(usize::MAX)),
    })
}

// -- replication ---------------------------------------------------------------

pub fn append_to_proto(req: AppendRequest) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term: req.term,
        leader_id: req.leader_id,
        leader_addr: req.leader_addr,
        prev_index: req.prev_index,
        prev_term: req.prev_term,
        frames: req.frames,
        leader_commit: req.leader_commit,
    }
}

pub fn append_from_proto(req: AppendEntriesRequest) -> AppendRequest {
    AppendRequest {
        term: req.term,
        leader_id: req.leader_id,
        leader_addr: req.leader_addr,
        prev_index: req.prev_index,
        prev_term: req.prev_term,
        frames: req.frames,
        leader_commit: req.leader_commit,
    }
}

pub fn append_response_to_proto(resp: AppendResponse) -> AppendEntriesResponse {
    AppendEntriesResponse { term: resp.term, success: resp.success, last_index: resp.last_index }
}

pub fn append_response_from_proto(resp: AppendEntriesResponse) -> AppendResponse {
    AppendResponse { term: resp.term, success: resp.success, last_index: resp.last_index }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_carries_hint_both_ways() {
        let status = urd_to_status(UrdError::NotLeader { leader: Some("10.0.0.2:8099".into()) });
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(
            status.metadata().get(LEADER_ADDR_HEADER).unwrap().to_str().unwrap(),
            "10.0.0.2:8099"
        );
        assert_eq!(
            status_to_urd(status),
            UrdError::NotLeader { leader: Some("10.0.0.2:8099".into()) }
        );
    }

    #[test]
    fn error_kinds_map_to_codes() {
        assert_eq!(urd_to_status(UrdError::DatabaseNotFound).code(), Code::NotFound);
        assert_eq!(urd_to_status(UrdError::DatabaseExists).code(), Code::AlreadyExists);
        assert_eq!(urd_to_status(UrdError::UsernameRequired).code(), Code::InvalidArgument);
        assert_eq!(urd_to_status(UrdError::Framing("bad".into())).code(), Code::DataLoss);
        assert_eq!(
            urd_to_status(UrdError::PermissionDenied("x".into())).code(),
            Code::PermissionDenied
        );
        assert_eq!(
            urd_to_status(UrdError::QuorumNotReached { acks: 1, required: 2 }).code(),
            Code::Unavailable
        );
        assert_eq!(urd_to_status(UrdError::Storage("disk".into())).code(), Code::Internal);
    }

    #[test]
    fn null_values_survive_the_wire() {
        let series = Series {
            name: "cpu".into(),
            fields: vec!["a".into(), "b".into()],
            points: vec![Point {
                timestamp: Some(7),
                sequence_number: None,
                values: vec![FieldValue::Null, FieldValue::Double(0.5)],
            }],
        };
        assert_eq!(series_from_proto(series_to_proto(series.clone())), series);
    }

    #[test]
    fn query_needs_selector_and_range() {
        let spec = query_to_proto(Query::select("cpu").between(0, 10).limit(3));
        assert_eq!(query_from_proto(spec.clone()).unwrap(), Query::select("cpu").between(0, 10).limit(3));

        let no_selector = QuerySpec { selector: None, ..spec.clone() };
        assert!(query_from_proto(no_selector).is_err());
        let empty_range = QuerySpec { start: 10, end: 10, ..spec.clone() };
        assert!(query_from_proto(empty_range).is_err());
        let bad_regex = QuerySpec { selector: Some(Selector::Regex("(".into())), ..spec };
        assert!(query_from_proto(bad_regex).is_err());
    }
}
