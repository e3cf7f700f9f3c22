//! Span tree reconstruction
//!
//! Turns the flat, unordered span list of one trace into a parent/children
//! forest. Spans whose parent is missing from the set (expired, never
//! delivered) become roots instead of being dropped.
//!
//! Nothing here recurses on the depth of the tree: a trace may hold a parent
//! chain as long as its span count.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Serialize, Serializer};

use crate::models::Span;

/// Nesting levels kept when a tree is serialized
///
/// Descendants below this level are listed flat, depth-first, under their
/// ancestor at the last nested level. Each still carries `parent_span_id`.
pub const MAX_NESTED_DEPTH: usize = 64;

/// A span together with its children, siblings ordered by start time
pub struct SpanNode<'a> {
    /// The span at this position
    pub span: &'a Span,

    /// Child spans, oldest first
    pub children: Vec<SpanNode<'a>>,
}

impl<'a> SpanNode<'a> {
    fn leaf(span: &'a Span) -> Self {
        Self {
            span,
            children: Vec::new(),
        }
    }

    /// Number of spans in this subtree, including this one
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            count += 1;
            pending.extend(&node.children);
        }
        count
    }

    /// Always false: a node contains at least itself
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Pre-order walk yielding `(depth, span)`, the shape an indented view needs
    pub fn depth_first(&self) -> Vec<(usize, &'a Span)> {
        self.nodes()
            .into_iter()
            .map(|(depth, node)| (depth, node.span))
            .collect()
    }

    fn nodes(&self) -> Vec<(usize, &SpanNode<'a>)> {
        let mut out = Vec::new();
        let mut pending = vec![(0, self)];
        while let Some((depth, node)) = pending.pop() {
            out.push((depth, node));
            pending.extend(node.children.iter().rev().map(|child| (depth + 1, child)));
        }
        out
    }
}

impl fmt::Debug for SpanNode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanNode")
            .field("span_id", &self.span.span_id)
            .field("children", &self.children.len())
            .finish()
    }
}

impl Drop for SpanNode<'_> {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

impl Serialize for SpanNode<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Nested {
            node: self,
            depth: 0,
        }
        .serialize(serializer)
    }
}

/// A node at a known nesting level while serializing
struct Nested<'n, 'a> {
    node: &'n SpanNode<'a>,
    depth: usize,
}

#[derive(Serialize)]
struct Row<'n, 'a> {
    #[serde(flatten)]
    span: &'a Span,
    children: Vec<Nested<'n, 'a>>,
}

impl Serialize for Nested<'_, '_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let depth = self.depth + 1;
        let children = if depth < MAX_NESTED_DEPTH {
            self.node
                .children
                .iter()
                .map(|node| Nested { node, depth })
                .collect()
        } else if depth == MAX_NESTED_DEPTH {
            self.node
                .children
                .iter()
                .flat_map(SpanNode::nodes)
                .map(|(_, node)| Nested { node, depth })
                .collect()
        } else {
            Vec::new()
        };
        Row {
            span: self.node.span,
            children,
        }
        .serialize(serializer)
    }
}

/// Build the span forest of one trace
pub fn build_forest(spans: &[Span]) -> Vec<SpanNode<'_>> {
    let ids: HashSet<&str> = spans.iter().map(|s| s.span_id.as_str()).collect();

    let mut children: HashMap<&str, Vec<&Span>> = HashMap::new();
    let mut roots: Vec<&Span> = Vec::new();
    for span in spans {
        match span.parent_span_id.as_deref() {
            Some(parent) if parent != span.span_id && ids.contains(parent) => {
                children.entry(parent).or_default().push(span);
            }
            _ => roots.push(span),
        }
    }
    for siblings in children.values_mut() {
        sort_siblings(siblings);
    }
    sort_siblings(&mut roots);

    let mut visited: HashSet<&str> = HashSet::with_capacity(spans.len());
    let mut forest: Vec<SpanNode<'_>> = roots
        .into_iter()
        .filter_map(|root| attach(root, &children, &mut visited))
        .collect();

    // A parent cycle is unreachable from any root; surface it rather than lose it.
    let mut stranded: Vec<&Span> = spans
        .iter()
        .filter(|s| !visited.contains(s.span_id.as_str()))
        .collect();
    sort_siblings(&mut stranded);
    for span in stranded {
        forest.extend(attach(span, &children, &mut visited));
    }

    forest
}

/// Depth-first flattening of a whole forest
pub fn flatten<'a>(forest: &[SpanNode<'a>]) -> Vec<(usize, &'a Span)> {
    forest.iter().flat_map(SpanNode::depth_first).collect()
}

/// The subtree under `root`, or `None` when `root` was already placed
fn attach<'a>(
    root: &'a Span,
    children: &HashMap<&str, Vec<&'a Span>>,
    visited: &mut HashSet<&'a str>,
) -> Option<SpanNode<'a>> {
    // Pre-order listing with each entry's parent position.
    let mut order: Vec<(&'a Span, Option<usize>)> = Vec::new();
    let mut pending = vec![(root, None)];
    while let Some((span, parent)) = pending.pop() {
        if !visited.insert(span.span_id.as_str()) {
            continue;
        }
        let at = order.len();
        order.push((span, parent));
        if let Some(kids) = children.get(span.span_id.as_str()) {
            pending.extend(
                kids.iter()
                    .rev()
                    .filter(|kid| !visited.contains(kid.span_id.as_str()))
                    .map(|kid| (*kid, Some(at))),
            );
        }
    }

    // Every descendant sits after its parent, so folding from the back
    // completes each node before it is handed up.
    let mut nodes: Vec<Option<SpanNode<'a>>> =
        order.iter().map(|&(span, _)| Some(SpanNode::leaf(span))).collect();
    for at in (1..order.len()).rev() {
        let (Some(mut node), Some(parent)) = (nodes[at].take(), order[at].1) else {
            continue;
        };
        node.children.reverse();
        if let Some(parent) = nodes[parent].as_mut() {
            parent.children.push(node);
        }
    }
    let mut root = nodes.into_iter().next().flatten()?;
    root.children.reverse();
    Some(root)
}

fn sort_siblings(spans: &mut [&Span]) {
    spans.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.span_id.cmp(&b.span_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SpanType;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn span(id: &str, parent: Option<&str>, start: i64) -> Span {
        let mut s = Span::new(id, "trace", id, SpanType::Function, at(start), Duration::days(90));
        s.parent_span_id = parent.map(str::to_string);
        s
    }

    fn names(forest: &[SpanNode<'_>]) -> Vec<(usize, String)> {
        flatten(forest)
            .into_iter()
            .map(|(depth, s)| (depth, s.span_id.clone()))
            .collect()
    }

    #[test]
    fn nests_children_under_parents_in_start_order() {
        let spans = vec![
            span("b", Some("root"), 3),
            span("root", None, 0),
            span("a", Some("root"), 1),
            span("a1", Some("a"), 2),
        ];
        let forest = build_forest(&spans);
        assert_eq!(forest.len(), 1);
        assert_eq!(
            names(&forest),
            vec![
                (0, "root".to_string()),
                (1, "a".to_string()),
                (2, "a1".to_string()),
                (1, "b".to_string()),
            ]
        );
    }

    #[test]
    fn orphans_become_roots() {
        let spans = vec![span("root", None, 0), span("lost", Some("expired"), 1)];
        let forest = build_forest(&spans);
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[1].span.span_id, "lost");
    }

    #[test]
    fn self_parent_and_cycles_do_not_lose_spans() {
        let spans = vec![
            span("self", Some("self"), 0),
            span("x", Some("y"), 1),
            span("y", Some("x"), 2),
        ];
        let forest = build_forest(&spans);
        assert_eq!(forest.iter().map(SpanNode::len).sum::<usize>(), 3);
    }

    #[test]
    fn deep_chains_build_and_serialize_without_recursion() {
        const DEPTH: usize = 100_000;
        let spans: Vec<Span> = (0..DEPTH)
            .map(|i| {
                let parent = i.checked_sub(1).map(|p| format!("s{p}"));
                span(&format!("s{i}"), parent.as_deref(), i as i64)
            })
            .collect();

        let forest = build_forest(&spans);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].len(), DEPTH);
        let flat = flatten(&forest);
        assert_eq!(flat.len(), DEPTH);
        assert_eq!(flat[DEPTH - 1], (DEPTH - 1, &spans[DEPTH - 1]));

        let json = serde_json::to_value(&forest).unwrap();
        let mut node = &json[0];
        for level in 1..MAX_NESTED_DEPTH {
            node = &node["children"][0];
            assert_eq!(node["span_id"], format!("s{level}"));
        }
        let rest = node["children"].as_array().unwrap();
        assert_eq!(rest.len(), DEPTH - MAX_NESTED_DEPTH);
        assert_eq!(rest[0]["span_id"], format!("s{MAX_NESTED_DEPTH}"));
        assert_eq!(rest[0]["parent_span_id"], format!("s{}", MAX_NESTED_DEPTH - 1));
        assert!(rest.iter().all(|leaf| leaf["children"] == serde_json::json!([])));
    }

    #[test]
    fn shallow_trees_serialize_fully_nested() {
        let spans = vec![span("root", None, 0), span("a", Some("root"), 1), span("a1", Some("a"), 2)];
        let json = serde_json::to_value(build_forest(&spans)).unwrap();
        assert_eq!(json[0]["span_id"], "root");
        assert_eq!(json[0]["children"][0]["span_id"], "a");
        assert_eq!(json[0]["children"][0]["children"][0]["span_id"], "a1");
        assert_eq!(json[0]["children"][0]["children"][0]["children"], serde_json::json!([]));
    }

    #[test]
    fn empty_input_builds_empty_forest() {
        assert!(build_forest(&[]).is_empty());
    }

    proptest! {
        // Every span's parent is chosen among spans created before it, the
        // way the ingestion API admits them.
        #[test]
        fn valid_sequences_yield_every_span_exactly_once(
            parents in proptest::collection::vec(proptest::option::of(0usize..64), 1..64)
        ) {
            let spans: Vec<Span> = parents
                .iter()
                .enumerate()
                .map(|(i, parent)| {
                    let parent = parent.filter(|p| *p < i).map(|p| format!("s{p}"));
                    span(&format!("s{i}"), parent.as_deref(), i as i64)
                })
                .collect();

            let forest = build_forest(&spans);
            let flat = flatten(&forest);
            prop_assert_eq!(flat.len(), spans.len());

            let unique: HashSet<&str> = flat.iter().map(|(_, s)| s.span_id.as_str()).collect();
            prop_assert_eq!(unique.len(), spans.len());

            for root in &forest {
                prop_assert!(root.span.parent_span_id.is_none());
            }
        }
    }
}
