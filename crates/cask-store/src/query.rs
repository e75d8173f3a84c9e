//! Structural equality matching over parsed JSON documents.
//!
//! A [`Filter`] pairs a `/`-separated path expression with a set of accepted
//! scalar values. Path segments name object keys or array indices; a `*`
//! segment matches any single key or index, or nothing at all (the rest of
//! the path may continue from the current location). Matching a filter
//! against a document produces a [`MatchMap`] keyed by *anchor*: the
//! concrete path prefix covering everything the wildcards bound (empty when
//! they bound nothing). Two filters that match inside the same element
//! therefore produce the same anchor, which is what makes `And` combination
//! mean "this same element satisfies every predicate".

use std::collections::BTreeMap;

use serde_json::Value;

/// Matched locations: anchor path -> sub-structure at that anchor.
///
/// The anchor is the empty string for filters without a wildcard (the match
/// is then anchored at the query root itself).
pub type MatchMap = BTreeMap<String, Value>;

/// How the match maps of multiple filters are combined per document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Combine {
    /// Intersect anchor sets: every filter must match inside the same
    /// element. Short-circuits to no match when any filter matches nothing.
    #[default]
    And,
    /// Union of all per-filter matches: any filter matching is enough.
    Or,
}

/// A single equality predicate: a path expression and the scalar values it
/// accepts at that path.
#[derive(Clone, Debug)]
pub struct Filter {
    pub path: String,
    pub accepted: Vec<Value>,
}

impl Filter {
    /// Filter accepting exactly one value at `path`.
    pub fn new(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            accepted: vec![value.into()],
        }
    }

    /// Filter accepting any of `values` at `path`.
    pub fn any_of(path: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            path: path.into(),
            accepted: values,
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        self.accepted.iter().any(|accepted| accepted == value)
    }
}

/// Resolve the sub-object equality queries are scoped to.
///
/// An empty `query_root` scopes to the whole document. A missing root means
/// the document cannot match anything (empty map, never an error).
pub(crate) fn scope<'a>(document: &'a Value, query_root: &str) -> Option<&'a Value> {
    if query_root.is_empty() {
        Some(document)
    } else {
        document.get(query_root)
    }
}

/// Match one filter against a query scope.
///
/// Returns the map of anchors whose leaf value was accepted. A path that
/// matches nothing yields an empty map.
pub(crate) fn filter_matches(scope: &Value, filter: &Filter) -> MatchMap {
    let segments: Vec<&str> = filter.path.split('/').collect();
    let mut matches = MatchMap::new();
    let mut bound = Vec::with_capacity(segments.len());
    descend(scope, scope, &segments, 0, &mut bound, filter, &mut matches);
    matches
}

// `anchor_len` is the number of bound segments up to and including whatever
// the most recent wildcard bound; the anchor of a leaf match is that prefix.
fn descend(
    scope: &Value,
    value: &Value,
    segments: &[&str],
    anchor_len: usize,
    bound: &mut Vec<String>,
    filter: &Filter,
    matches: &mut MatchMap,
) {
    let Some((segment, rest)) = segments.split_first() else {
        if filter.accepts(value) {
            let anchor_segments = &bound[..anchor_len];
            if let Some(substructure) = lookup(scope, anchor_segments) {
                matches.insert(anchor_segments.join("/"), substructure.clone());
            }
        }
        return;
    };

    if *segment == "*" {
        // Zero-width: the rest of the path may resolve from right here.
        descend(scope, value, rest, anchor_len, bound, filter, matches);
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    bound.push(key.clone());
                    descend(scope, child, rest, bound.len(), bound, filter, matches);
                    bound.pop();
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    bound.push(index.to_string());
                    descend(scope, child, rest, bound.len(), bound, filter, matches);
                    bound.pop();
                }
            }
            _ => {}
        }
    } else {
        let child = match value {
            Value::Object(map) => map.get(*segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index)),
            _ => None,
        };
        if let Some(child) = child {
            bound.push((*segment).to_string());
            descend(scope, child, rest, anchor_len, bound, filter, matches);
            bound.pop();
        }
    }
}

/// Navigate a concrete (wildcard-free) path from the scope root.
fn lookup<'a>(scope: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut current = scope;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Combine per-filter match maps into the document's final match map.
pub(crate) fn combine_matches(per_filter: Vec<MatchMap>, combine: Combine) -> MatchMap {
    let mut maps = per_filter.into_iter();
    let mut merged = maps.next().unwrap_or_default();
    for map in maps {
        match combine {
            Combine::And => merged.retain(|anchor, _| map.contains_key(anchor)),
            Combine::Or => merged.extend(map),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn perms_doc() -> Value {
        json!({
            "passwd": {
                "perms": {"group": {"write": false}, "owner": {"write": true}},
                "size": 1024
            },
            "shadow": {
                "perms": {"group": {"write": true}, "owner": {"write": true}},
                "size": 512
            }
        })
    }

    #[test]
    fn wildcard_binds_matching_elements() {
        let doc = perms_doc();
        let filter = Filter::new("*/perms/group/write", false);
        let matches = filter_matches(&doc, &filter);
        assert_eq!(matches.len(), 1);
        assert!(matches.contains_key("passwd"));
        // The match map carries the sub-structure at the anchor.
        assert_eq!(matches["passwd"]["size"], json!(1024));
    }

    #[test]
    fn wildcard_matches_multiple_elements() {
        let doc = perms_doc();
        let filter = Filter::new("*/perms/owner/write", true);
        let matches = filter_matches(&doc, &filter);
        assert_eq!(matches.len(), 2);
        assert!(matches.contains_key("passwd"));
        assert!(matches.contains_key("shadow"));
    }

    #[test]
    fn wildcard_also_matches_at_scope_root() {
        // The path may resolve with the wildcard binding nothing, for
        // documents whose fields sit directly under the query root.
        let doc = json!({"perms": {"group": {"write": false}}});
        let filter = Filter::new("*/perms/group/write", false);
        let matches = filter_matches(&doc, &filter);
        assert_eq!(matches.len(), 1);
        assert!(matches.contains_key(""));
    }

    #[test]
    fn concrete_path_anchors_at_root() {
        let doc = perms_doc();
        let filter = Filter::new("passwd/size", 1024);
        let matches = filter_matches(&doc, &filter);
        assert_eq!(matches.len(), 1);
        assert!(matches.contains_key(""));
    }

    #[test]
    fn no_match_is_empty_not_error() {
        let doc = perms_doc();
        let filter = Filter::new("*/perms/other/write", true);
        assert!(filter_matches(&doc, &filter).is_empty());

        let filter = Filter::new("nonexistent/deeply/nested", 1);
        assert!(filter_matches(&doc, &filter).is_empty());
    }

    #[test]
    fn wildcard_over_array_binds_indices() {
        let doc = json!({"mounts": [{"fstype": "ext4"}, {"fstype": "tmpfs"}]});
        let filter = Filter::new("mounts/*/fstype", "tmpfs");
        let matches = filter_matches(&doc, &filter);
        assert_eq!(matches.len(), 1);
        assert!(matches.contains_key("mounts/1"));
    }

    #[test]
    fn numeric_segment_indexes_arrays() {
        let doc = json!({"addrs": ["10.0.0.1", "10.0.0.2"]});
        let filter = Filter::new("addrs/1", "10.0.0.2");
        let matches = filter_matches(&doc, &filter);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn any_of_accepts_each_value() {
        let doc = perms_doc();
        let filter = Filter::any_of("*/size", vec![json!(512), json!(1024)]);
        let matches = filter_matches(&doc, &filter);
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn and_intersects_anchors() {
        let doc = perms_doc();
        let group = filter_matches(&doc, &Filter::new("*/perms/group/write", false));
        let size = filter_matches(&doc, &Filter::new("*/size", 1024));
        let merged = combine_matches(vec![group, size], Combine::And);
        assert_eq!(merged.len(), 1);
        assert!(merged.contains_key("passwd"));
    }

    #[test]
    fn and_drops_non_common_anchors() {
        let doc = perms_doc();
        let owner = filter_matches(&doc, &Filter::new("*/perms/owner/write", true));
        let size = filter_matches(&doc, &Filter::new("*/size", 512));
        let merged = combine_matches(vec![owner, size], Combine::And);
        // owner/write matches both elements; size only matches shadow.
        assert_eq!(merged.len(), 1);
        assert!(merged.contains_key("shadow"));
    }

    #[test]
    fn or_unions_anchors() {
        let doc = perms_doc();
        let group = filter_matches(&doc, &Filter::new("*/perms/group/write", false));
        let size = filter_matches(&doc, &Filter::new("*/size", 512));
        let merged = combine_matches(vec![group, size], Combine::Or);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn scope_resolves_query_root() {
        let doc = json!({"data": {"a": 1}, "meta": {"b": 2}});
        assert_eq!(scope(&doc, "data"), Some(&json!({"a": 1})));
        assert_eq!(scope(&doc, ""), Some(&doc));
        assert_eq!(scope(&doc, "missing"), None);
    }
}
