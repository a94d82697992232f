//! Path Registry: static-prefers-dynamic trie matcher (spec §4.1).

use crate::handler::{Middleware, MutationHandler, QueryHandler};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Query handlers don't mutate and get no [`crate::scheduler::Scheduler`];
/// mutation handlers do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Query,
    Mutation,
}

/// A registered handler plus its middleware chain, stored as the registry's
/// leaf value. Carries its own [`Kind`] redundantly with [`Registration::kind`]
/// so matching code can dispatch without consulting the registration.
pub enum HandlerEntry {
    Query {
        middleware: Vec<Arc<dyn Middleware>>,
        handler: Arc<dyn QueryHandler>,
    },
    Mutation {
        middleware: Vec<Arc<dyn Middleware>>,
        handler: Arc<dyn MutationHandler>,
    },
}

impl HandlerEntry {
    pub fn query(middleware: Vec<Arc<dyn Middleware>>, handler: Arc<dyn QueryHandler>) -> Self {
        HandlerEntry::Query { middleware, handler }
    }

    pub fn mutation(middleware: Vec<Arc<dyn Middleware>>, handler: Arc<dyn MutationHandler>) -> Self {
        HandlerEntry::Mutation { middleware, handler }
    }

    pub fn kind(&self) -> Kind {
        match self {
            HandlerEntry::Query { .. } => Kind::Query,
            HandlerEntry::Mutation { .. } => Kind::Mutation,
        }
    }
}

/// One dotted segment of a [`PathPattern`]: either a literal token or a
/// `$name` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed, dot-separated registration path such as `users.$id.orders`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
    raw: String,
}

impl PathPattern {
    pub fn parse(path: &str) -> Result<Self, RegistryError> {
        if path.is_empty() {
            return Err(RegistryError::EmptyPath);
        }

        let mut segments = Vec::new();
        for part in path.split('.') {
            if part.is_empty() {
                return Err(RegistryError::EmptySegment(path.to_string()));
            }
            if let Some(name) = part.strip_prefix('$') {
                if name.is_empty() {
                    return Err(RegistryError::EmptySegment(path.to_string()));
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(PathPattern {
            segments,
            raw: path.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("path must not be empty")]
    EmptyPath,
    #[error("path {0:?} has an empty segment")]
    EmptySegment(String),
    #[error("path {0:?} conflicts with already-registered path {1:?}")]
    Conflict(String, String),
}

/// A registered handler: kind, pattern, and an opaque handler id. The
/// Message Handler dereferences `handler_id` against its own handler table;
/// the registry itself is payload-agnostic.
#[derive(Debug)]
pub struct Registration<H> {
    pub kind: Kind,
    pub pattern: PathPattern,
    pub handler: Arc<H>,
}

/// The result of a successful [`Registry::match_path`] call.
#[derive(Debug, Clone)]
pub struct Matched<H> {
    pub registration: Registration<H>,
    pub params: HashMap<String, String>,
}

#[derive(Default)]
struct Node<H> {
    literal: HashMap<String, Node<H>>,
    dynamic: Option<(String, Box<Node<H>>)>,
    leaf: Option<Registration<H>>,
}

impl<H> Node<H> {
    fn new() -> Self {
        Node {
            literal: HashMap::new(),
            dynamic: None,
            leaf: None,
        }
    }
}

/// Append-only trie of registered paths. Registration fails loudly on any
/// ambiguity (spec invariant 4); matching never fails, it simply returns
/// `None` on a miss.
pub struct Registry<H> {
    root: Node<H>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Registry { root: Node::new() }
    }

    /// Register a handler at `pattern`. Fails if an existing registration
    /// produces the same literal/dynamic position sequence, or differs only
    /// in a dynamic segment's parameter name at the same position.
    pub fn register(
        &mut self,
        kind: Kind,
        pattern: PathPattern,
        handler: H,
    ) -> Result<(), RegistryError> {
        let segments = pattern.segments.clone();
        let mut node = &mut self.root;

        for segment in &segments {
            match segment {
                Segment::Literal(name) => {
                    // A literal at this position alongside an existing
                    // dynamic child is allowed by the spec (literal
                    // coexists, match prefers literal) — only the leaf
                    // position-sequence conflict below is an error.
                    node = node.literal.entry(name.clone()).or_insert_with(Node::new);
                }
                Segment::Param(name) => match &mut node.dynamic {
                    Some((existing_name, _)) if existing_name != name => {
                        return Err(RegistryError::Conflict(
                            pattern.raw.clone(),
                            format!(
                                "existing dynamic segment named {existing_name:?} at the same position"
                            ),
                        ));
                    }
                    Some((_, child)) => {
                        node = child;
                    }
                    None => {
                        node.dynamic = Some((name.clone(), Box::new(Node::new())));
                        node = &mut node.dynamic.as_mut().unwrap().1;
                    }
                },
            }
        }

        if node.leaf.is_some() {
            let existing = node.leaf.as_ref().unwrap().pattern.raw.clone();
            return Err(RegistryError::Conflict(pattern.raw.clone(), existing));
        }

        node.leaf = Some(Registration {
            kind,
            pattern,
            handler: Arc::new(handler),
        });

        Ok(())
    }

    /// Number of leaf registrations in the trie. Diagnostic only; matching
    /// never consults it.
    pub fn len(&self) -> usize {
        fn count<H>(node: &Node<H>) -> usize {
            let mut total = usize::from(node.leaf.is_some());
            total += node.literal.values().map(count).sum::<usize>();
            if let Some((_, child)) = &node.dynamic {
                total += count(child);
            }
            total
        }
        count(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Match `subject` against the trie. Literal branches are explored
    /// before dynamic ones, recursively: a dynamic branch at an outer
    /// position is only tried once every literal possibility at every inner
    /// position has been exhausted.
    pub fn match_path(&self, subject: &str) -> Option<Matched<H>> {
        let segments: Vec<&str> = subject.split('.').collect();
        let mut params = HashMap::new();
        let registration = Self::walk(&self.root, &segments, &mut params)?;
        Some(Matched {
            registration,
            params,
        })
    }

    fn walk(
        node: &Node<H>,
        segments: &[&str],
        params: &mut HashMap<String, String>,
    ) -> Option<Registration<H>> {
        let Some((head, rest)) = segments.split_first() else {
            return node.leaf.clone();
        };

        if let Some(child) = node.literal.get(*head) {
            if let Some(found) = Self::walk(child, rest, params) {
                return Some(found);
            }
        }

        if let Some((name, child)) = &node.dynamic {
            let previous = params.insert(name.clone(), (*head).to_string());
            if let Some(found) = Self::walk(child, rest, params) {
                return Some(found);
            }
            match previous {
                Some(value) => {
                    params.insert(name.clone(), value);
                }
                None => {
                    params.remove(name);
                }
            }
        }

        None
    }
}

impl<H> Clone for Registration<H> {
    fn clone(&self) -> Self {
        Registration {
            kind: self.kind,
            pattern: self.pattern.clone(),
            handler: self.handler.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literal_and_param_segments() {
        let pattern = PathPattern::parse("users.$id.orders").unwrap();
        assert_eq!(pattern.as_str(), "users.$id.orders");
    }

    #[test]
    fn rejects_empty_path_and_segments() {
        assert_eq!(PathPattern::parse("").unwrap_err(), RegistryError::EmptyPath);
        assert!(matches!(
            PathPattern::parse("users..orders").unwrap_err(),
            RegistryError::EmptySegment(_)
        ));
        assert!(matches!(
            PathPattern::parse("users.$").unwrap_err(),
            RegistryError::EmptySegment(_)
        ));
    }

    #[test]
    fn matches_literal_over_dynamic() {
        let mut registry: Registry<&'static str> = Registry::new();
        registry
            .register(
                Kind::Query,
                PathPattern::parse("users.$id").unwrap(),
                "get_by_id",
            )
            .unwrap();
        registry
            .register(
                Kind::Query,
                PathPattern::parse("users.me").unwrap(),
                "get_me",
            )
            .unwrap();

        let matched = registry.match_path("users.me").unwrap();
        assert_eq!(*matched.registration.handler, "get_me");
        assert!(matched.params.is_empty());

        let matched = registry.match_path("users.42").unwrap();
        assert_eq!(*matched.registration.handler, "get_by_id");
        assert_eq!(matched.params.get("id"), Some(&"42".to_string()));
    }

    #[test]
    fn backtracks_past_a_literal_branch_that_fails_deeper() {
        // "orders.$id.items" vs "orders.summary.$section" — a request for
        // "orders.summary.totals" must fall through the literal "summary"
        // branch of the first registration's dynamic id slot... actually
        // exercise the real ambiguity: a literal prefix that matches but
        // dead-ends must not block the dynamic branch at the same node.
        let mut registry: Registry<&'static str> = Registry::new();
        registry
            .register(
                Kind::Query,
                PathPattern::parse("a.b.c").unwrap(),
                "exact",
            )
            .unwrap();
        registry
            .register(
                Kind::Query,
                PathPattern::parse("a.$x.d").unwrap(),
                "dynamic",
            )
            .unwrap();

        // "a.b.d": literal child "b" exists (shared with the exact route's
        // first segment) but has no further child named "d", so the walk
        // must backtrack to the root's dynamic branch and bind x = "b".
        let matched = registry.match_path("a.b.d").unwrap();
        assert_eq!(*matched.registration.handler, "dynamic");
        assert_eq!(matched.params.get("x"), Some(&"b".to_string()));
    }

    #[test]
    fn same_name_dynamic_segments_share_a_node() {
        let mut registry: Registry<&'static str> = Registry::new();
        registry
            .register(Kind::Query, PathPattern::parse("a.$id").unwrap(), "one")
            .unwrap();
        assert!(registry
            .register(Kind::Query, PathPattern::parse("a.$id.b").unwrap(), "two")
            .is_ok());
    }

    #[test]
    fn differing_dynamic_names_at_same_position_conflict() {
        let mut registry: Registry<&'static str> = Registry::new();
        registry
            .register(Kind::Query, PathPattern::parse("a.$id").unwrap(), "one")
            .unwrap();
        let err = registry
            .register(Kind::Query, PathPattern::parse("a.$slug").unwrap(), "two")
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_, _)));
    }

    #[test]
    fn identical_position_sequence_conflicts() {
        let mut registry: Registry<&'static str> = Registry::new();
        registry
            .register(Kind::Query, PathPattern::parse("a.b").unwrap(), "one")
            .unwrap();
        let err = registry
            .register(Kind::Query, PathPattern::parse("a.b").unwrap(), "two")
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_, _)));
    }

    #[test]
    fn len_counts_leaf_registrations() {
        let mut registry: Registry<&'static str> = Registry::new();
        assert!(registry.is_empty());
        registry
            .register(Kind::Query, PathPattern::parse("a.b").unwrap(), "one")
            .unwrap();
        registry
            .register(Kind::Query, PathPattern::parse("a.$id").unwrap(), "two")
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_empty());
    }

    #[test]
    fn no_match_returns_none() {
        let mut registry: Registry<&'static str> = Registry::new();
        registry
            .register(Kind::Query, PathPattern::parse("a.b").unwrap(), "one")
            .unwrap();
        assert!(registry.match_path("a.c").is_none());
        assert!(registry.match_path("a").is_none());
        assert!(registry.match_path("a.b.c").is_none());
    }
}
