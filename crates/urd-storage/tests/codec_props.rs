//! Property tests for the log entry framing.
//!
//! Uses proptest to check that arbitrary entries and arbitrary mixed
//! sequences of commands and snapshot markers survive a round trip, and
//! that every truncation of a valid stream is rejected.

use proptest::prelude::*;
use urd_storage::codec::{decode_entries, decode_entry, encode_entries, encode_entry};
use urd_storage::LogEntry;
use urd_types::UrdError;

/// Terms whose top byte is 0xFF cannot be framed, so stay below it.
fn command_strategy() -> impl Strategy<Value = LogEntry> {
    (
        0u64..0xFF00_0000_0000_0000,
        any::<u64>(),
        prop::collection::vec(any::<u8>(), 0..64),
    )
        .prop_map(|(term, index, data)| LogEntry::command(term, index, data))
}

fn entry_strategy() -> impl Strategy<Value = LogEntry> {
    prop_oneof![
        4 => command_strategy(),
        1 => Just(LogEntry::snapshot_marker()),
    ]
}

proptest! {
    #[test]
    fn single_entry_round_trips(entry in entry_strategy()) {
        let bytes = encode_entry(&entry).unwrap();
        prop_assert_eq!(decode_entry(&bytes).unwrap(), entry);
    }

    #[test]
    fn mixed_sequence_round_trips(entries in prop::collection::vec(entry_strategy(), 0..32)) {
        let bytes = encode_entries(&entries).unwrap();
        let decoded = decode_entries(&bytes).unwrap();
        prop_assert_eq!(decoded, entries);
    }

    #[test]
    fn every_truncation_is_a_framing_error(entry in command_strategy(), cut in 1usize..1000) {
        let bytes = encode_entry(&entry).unwrap();
        let cut = cut % bytes.len();
        prop_assume!(cut > 0);
        let err = decode_entries(&bytes[..cut]).unwrap_err();
        prop_assert!(matches!(err, UrdError::Framing(_)), "cut {}: {:?}", cut, err);
    }

    #[test]
    fn truncated_tail_never_yields_partial_entry(
        entries in prop::collection::vec(command_strategy(), 1..8),
        drop in 1usize..24,
    ) {
        let bytes = encode_entries(&entries).unwrap();
        let cut = bytes.len().saturating_sub(drop);
        prop_assume!(cut > 0);
        prop_assert!(decode_entries(&bytes[..cut]).is_err());
    }
}

#[test]
fn known_vector_matches() {
    let entry = LogEntry::command(3, 2, vec![4, 5, 6]);
    let expected: Vec<u8> = [3u64.to_be_bytes(), 2u64.to_be_bytes(), 3u64.to_be_bytes()]
        .concat()
        .into_iter()
        .chain([4, 5, 6])
        .collect();
    assert_eq!(encode_entry(&entry).unwrap(), expected);
    assert_eq!(decode_entry(&expected).unwrap(), entry);
}
