//! Dotted-path resolution and the parallel-instance id algebra.

use serde_json::Value;
use std::fmt;

// ─── Parallel-instance ids ────────────────────────────────────

/// A node id carried structurally as `(base, index?)` so hot paths never
/// re-parse strings. The joined `base_<index>` form exists only at the
/// store boundary; `parse` implements the authoritative persisted-state
/// suffix rule `^.+_(\d+)$`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParallelId {
    base: String,
    index: Option<u32>,
}

impl ParallelId {
    /// A plain (non-parallel) node id.
    pub fn base(id: impl Into<String>) -> Self {
        Self {
            base: id.into(),
            index: None,
        }
    }

    /// The `index`-th parallel instance of `base`.
    pub fn instance(base: impl Into<String>, index: u32) -> Self {
        Self {
            base: base.into(),
            index: Some(index),
        }
    }

    /// Parse a persisted key. A trailing `_<digits>` segment is the
    /// instance index; anything else is a base id.
    pub fn parse(raw: &str) -> Self {
        if let Some((head, tail)) = raw.rsplit_once('_') {
            if !head.is_empty()
                && !tail.is_empty()
                && tail.bytes().all(|b| b.is_ascii_digit())
            {
                if let Ok(index) = tail.parse::<u32>() {
                    return Self::instance(head, index);
                }
            }
        }
        Self::base(raw)
    }

    /// True if an *authored* id collides with the reserved suffix.
    pub fn has_reserved_suffix(id: &str) -> bool {
        Self::parse(id).index.is_some()
    }

    pub fn base_id(&self) -> &str {
        &self.base
    }

    pub fn index(&self) -> Option<u32> {
        self.index
    }

    pub fn is_instance(&self) -> bool {
        self.index.is_some()
    }

    /// This id re-targeted at a sibling base, keeping the index.
    pub fn with_base(&self, base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            index: self.index,
        }
    }

    /// The joined persisted form.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ParallelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}_{}", self.base, i),
            None => f.write_str(&self.base),
        }
    }
}

// ─── Dotted-path resolver ─────────────────────────────────────

/// Resolve a dotted path (`"a.b.0.c"`) against a JSON value. Object keys
/// and array indices only; any missing segment yields `null`. The empty
/// path is the identity.
pub fn resolve(value: &Value, path: &str) -> Value {
    if path.is_empty() {
        return value.clone();
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i))
            {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_suffixed_and_plain() {
        assert_eq!(ParallelId::parse("W_0"), ParallelId::instance("W", 0));
        assert_eq!(ParallelId::parse("W_12"), ParallelId::instance("W", 12));
        assert_eq!(ParallelId::parse("W"), ParallelId::base("W"));
        // Non-digit tail is part of the base.
        assert_eq!(ParallelId::parse("send_email"), ParallelId::base("send_email"));
        // Only the last segment counts.
        assert_eq!(
            ParallelId::parse("send_email_3"),
            ParallelId::instance("send_email", 3)
        );
        // A bare underscore-digits string has an empty head — not an instance.
        assert_eq!(ParallelId::parse("_3"), ParallelId::base("_3"));
    }

    #[test]
    fn render_round_trip() {
        for raw in ["W", "W_0", "a_b_7", "collector"] {
            assert_eq!(ParallelId::parse(raw).render(), raw);
        }
    }

    #[test]
    fn ordering_is_base_then_index() {
        let mut ids = vec![
            ParallelId::instance("b", 2),
            ParallelId::instance("a", 10),
            ParallelId::base("b"),
            ParallelId::instance("a", 2),
        ];
        ids.sort();
        assert_eq!(
            ids.iter().map(|i| i.render()).collect::<Vec<_>>(),
            vec!["a_2", "a_10", "b", "b_2"]
        );
    }

    #[test]
    fn reserved_suffix_detection() {
        assert!(ParallelId::has_reserved_suffix("step_1"));
        assert!(!ParallelId::has_reserved_suffix("step_one"));
        assert!(!ParallelId::has_reserved_suffix("step"));
    }

    #[test]
    fn resolve_objects_and_arrays() {
        let v = json!({"input": {"items": ["a", {"name": "b"}]}});
        assert_eq!(resolve(&v, "input.items.0"), json!("a"));
        assert_eq!(resolve(&v, "input.items.1.name"), json!("b"));
        assert_eq!(resolve(&v, "input.items"), json!(["a", {"name": "b"}]));
    }

    #[test]
    fn resolve_missing_yields_null() {
        let v = json!({"a": {"b": 1}});
        assert_eq!(resolve(&v, "a.c"), Value::Null);
        assert_eq!(resolve(&v, "a.b.c"), Value::Null);
        assert_eq!(resolve(&v, "x"), Value::Null);
        assert_eq!(resolve(&json!(null), "a"), Value::Null);
    }

    #[test]
    fn resolve_empty_path_is_identity() {
        let v = json!({"a": 1});
        assert_eq!(resolve(&v, ""), v);
    }
}
