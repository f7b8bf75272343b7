//! Fuzz target for position ordering.
//!
//! Comparison must never panic and must stay antisymmetric on arbitrary
//! file names and ack ids.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_client::position::compare_binlog_files;
use replication_client::Position;

fuzz_target!(|data: (&str, u64, &str, u64, &str, &str)| {
    let (fa, oa, fb, ob, ack_a, ack_b) = data;

    let ab = compare_binlog_files(fa, fb);
    let ba = compare_binlog_files(fb, fa);
    assert_eq!(ab, ba.reverse());

    let a = Position::binlog(fa, oa);
    let b = Position::binlog(fb, ob);
    if let (Some(x), Some(y)) = (a.partial_cmp(&b), b.partial_cmp(&a)) {
        assert_eq!(x, y.reverse());
    }

    let a = Position::stream("s1", ack_a);
    let b = Position::stream("s1", ack_b);
    if let (Some(x), Some(y)) = (a.partial_cmp(&b), b.partial_cmp(&a)) {
        assert_eq!(x, y.reverse());
    }
    let _ = a.has_progressed(&b);
});
