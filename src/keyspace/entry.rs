use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// A stored value: the tagged variant every command handler works with.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(Vec<u8>),
    List(Vec<Vec<u8>>),
    Set(HashSet<Vec<u8>>),
    /// Member/score pairs kept ordered by score, then member.
    SortedSet(Vec<(Vec<u8>, f64)>),
    Hash(HashMap<String, Vec<u8>>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::SortedSet(_) => "sortedset",
            Value::Hash(_) => "hash",
        }
    }
}

/// A value plus its optional absolute expiry (milliseconds since the epoch).
/// An entry past its expiry is logically absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub expires_at: Option<u64>,
}

impl Entry {
    pub fn new(value: Value) -> Self {
        Entry {
            value,
            expires_at: None,
        }
    }

    pub fn with_expiry(value: Value, expires_at: u64) -> Self {
        Entry {
            value,
            expires_at: Some(expires_at),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|exp| now_ms >= exp)
    }

    /// Remaining lifetime in milliseconds: -1 without expiry, -2 when already
    /// expired.
    pub fn ttl_millis(&self, now_ms: u64) -> i64 {
        match self.expires_at {
            None => -1,
            Some(exp) if now_ms >= exp => -2,
            Some(exp) => (exp - now_ms) as i64,
        }
    }
}

/// Wall-clock milliseconds since the epoch. Replicated commands never call
/// this on the apply path; they read the clock stamped into the log record.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_absolute() {
        let entry = Entry::with_expiry(Value::Int(1), 1_000);
        assert!(!entry.is_expired(999));
        assert!(entry.is_expired(1_000));
        assert!(entry.is_expired(2_000));
    }

    #[test]
    fn ttl_reporting() {
        let entry = Entry::new(Value::Str(b"v".to_vec()));
        assert_eq!(entry.ttl_millis(0), -1);

        let entry = Entry::with_expiry(Value::Str(b"v".to_vec()), 5_000);
        assert_eq!(entry.ttl_millis(2_000), 3_000);
        assert_eq!(entry.ttl_millis(5_000), -2);
    }
}
