//! Source positions.
//!
//! A [`Position`] identifies a resumable point in a source's change stream.
//! The binlog variant is a `(file, offset)` pair; the stream variant is a
//! `(streaming_id, ack_id)` pair handed out by the CDC server.
//!
//! # Ordering
//!
//! Positions are only partially ordered:
//!
//! ```text
//! binlog.000029:9000  <  binlog.000030:4       (file suffix first)
//! binlog.000030:4     <  binlog.000030:120     (then offset)
//! stream(a)@7         <  stream(a)@8           (same streaming id)
//! stream(a)@7         ?  stream(b)@8           (incomparable)
//! binlog.*            ?  stream(*)             (incomparable)
//! ```
//!
//! Stream ack ids are opaque to us. Two ack ids compare numerically when
//! both are decimal integers; otherwise they are only comparable when equal.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A resumable point in a source's change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Position {
    /// MySQL binlog coordinates.
    Binlog {
        file_name: String,
        offset: u64,
        /// Server id of the source that wrote the event.
        server_id: u32,
    },
    /// CDC stream coordinates.
    Stream { streaming_id: String, ack_id: String },
}

impl Position {
    pub fn binlog(file_name: impl Into<String>, offset: u64) -> Self {
        Self::Binlog {
            file_name: file_name.into(),
            offset,
            server_id: 0,
        }
    }

    pub fn stream(streaming_id: impl Into<String>, ack_id: impl Into<String>) -> Self {
        Self::Stream {
            streaming_id: streaming_id.into(),
            ack_id: ack_id.into(),
        }
    }

    /// Has the stream advanced from `since` to `self`?
    ///
    /// Incomparable positions count as progress for the stream variant
    /// (the server issues a new ack id per batch) and as no progress
    /// otherwise.
    pub fn has_progressed(&self, since: &Position) -> bool {
        match self.partial_cmp(since) {
            Some(Ordering::Greater) => true,
            Some(_) => false,
            None => matches!(
                (self, since),
                (
                    Position::Stream { streaming_id: a, ack_id: x },
                    Position::Stream { streaming_id: b, ack_id: y },
                ) if a == b && x != y
            ),
        }
    }

    pub fn is_binlog(&self) -> bool {
        matches!(self, Position::Binlog { .. })
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Position::Stream { .. })
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        let ordering = match (self, other) {
            (
                Position::Binlog { file_name: fa, offset: oa, .. },
                Position::Binlog { file_name: fb, offset: ob, .. },
            ) => compare_binlog_files(fa, fb).then(oa.cmp(ob)),
            (
                Position::Stream { streaming_id: sa, ack_id: aa },
                Position::Stream { streaming_id: sb, ack_id: ab },
            ) => {
                if sa != sb {
                    return None;
                }
                compare_ack_ids(aa, ab)?
            }
            _ => return None,
        };
        // Same coordinates, different source server id.
        if ordering == Ordering::Equal {
            return None;
        }
        Some(ordering)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Binlog { file_name, offset, .. } => write!(f, "{}:{}", file_name, offset),
            Position::Stream { streaming_id, ack_id } => write!(f, "{}@{}", streaming_id, ack_id),
        }
    }
}

/// Compare two binlog file names by their numeric suffix.
///
/// `binlog.000029` < `binlog.000030` < `binlog.1000000`. Names without a
/// numeric suffix fall back to lexicographic order.
pub fn compare_binlog_files(a: &str, b: &str) -> Ordering {
    match (binlog_suffix(a), binlog_suffix(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

fn binlog_suffix(name: &str) -> Option<u64> {
    let (_, suffix) = name.rsplit_once('.')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

fn compare_ack_ids(a: &str, b: &str) -> Option<Ordering> {
    if a == b {
        return Some(Ordering::Equal);
    }
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => Some(x.cmp(&y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_binlog_files() {
        assert_eq!(compare_binlog_files("binlog.000029", "binlog.000030"), Ordering::Less);
        assert_eq!(compare_binlog_files("binlog.000030", "binlog.000030"), Ordering::Equal);
        // Suffix width grows past six digits
        assert_eq!(compare_binlog_files("binlog.999999", "binlog.1000000"), Ordering::Less);
        assert_eq!(compare_binlog_files("mysql-bin", "mysql-bin.000001"), Ordering::Less);
    }

    #[test]
    fn test_binlog_position_ordering() {
        let a = Position::binlog("binlog.000029", 9000);
        let b = Position::binlog("binlog.000030", 4);
        let c = Position::binlog("binlog.000030", 120);

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
        assert_eq!(c.partial_cmp(&c.clone()), Some(Ordering::Equal));
    }

    #[test]
    fn test_binlog_different_server_id_incomparable() {
        let a = Position::Binlog {
            file_name: "binlog.000001".into(),
            offset: 4,
            server_id: 1,
        };
        let b = Position::Binlog {
            file_name: "binlog.000001".into(),
            offset: 4,
            server_id: 2,
        };
        assert_eq!(a.partial_cmp(&b), None);
    }

    #[test]
    fn test_stream_position_ordering() {
        let a = Position::stream("s1", "7");
        let b = Position::stream("s1", "8");
        assert!(a < b);
        assert!(b.has_progressed(&a));
        assert!(!a.has_progressed(&b));
    }

    #[test]
    fn test_stream_different_ids_incomparable() {
        let a = Position::stream("s1", "7");
        let b = Position::stream("s2", "8");
        assert_eq!(a.partial_cmp(&b), None);
        assert!(!b.has_progressed(&a));
    }

    #[test]
    fn test_stream_opaque_ack_ids() {
        let a = Position::stream("s1", "job_a_1f0c");
        let b = Position::stream("s1", "job_a_77aa");
        assert_eq!(a.partial_cmp(&b), None);
        // A fresh ack id on the same stream is progress
        assert!(b.has_progressed(&a));
        assert!(!a.has_progressed(&a.clone()));
    }

    #[test]
    fn test_mixed_variants_incomparable() {
        let a = Position::binlog("binlog.000001", 4);
        let b = Position::stream("s1", "1");
        assert_eq!(a.partial_cmp(&b), None);
        assert!(!a.has_progressed(&b));
    }

    #[test]
    fn test_display() {
        assert_eq!(Position::binlog("binlog.000029", 4).to_string(), "binlog.000029:4");
        assert_eq!(Position::stream("abc", "12").to_string(), "abc@12");
    }

    #[test]
    fn test_serde_tagged() {
        let pos = Position::binlog("binlog.000002", 1234);
        let json = serde_json::to_string(&pos).unwrap();
        assert!(json.contains("\"kind\":\"binlog\""));
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pos);
    }
}
