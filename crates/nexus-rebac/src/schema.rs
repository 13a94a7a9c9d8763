//! Namespace schemas: per object type, `relation → rewrite rule`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How a relation resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewriteRule {
    /// Plain tuple match: `subject --relation--> object`.
    Direct,
    /// Succeeds if any child relation succeeds.
    Union(Vec<String>),
    /// Follow `tupleset` edges off the object, then check `computed` on
    /// each target. `(file, /d/a) --parent--> (file, /d)` with
    /// `{tupleset: parent, computed: owner}` asks whether the subject owns
    /// the parent.
    TupleToUserset { tupleset: String, computed: String },
}

/// Relation rules for one object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceSchema {
    pub object_type: String,
    pub relations: HashMap<String, RewriteRule>,
}

impl NamespaceSchema {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            relations: HashMap::new(),
        }
    }

    pub fn relation(mut self, name: impl Into<String>, rule: RewriteRule) -> Self {
        self.relations.insert(name.into(), rule);
        self
    }

    /// Rule for a relation; unknown relations fall back to direct match.
    pub fn rule(&self, relation: &str) -> RewriteRule {
        self.relations
            .get(relation)
            .cloned()
            .unwrap_or(RewriteRule::Direct)
    }
}

fn union(children: &[&str]) -> RewriteRule {
    RewriteRule::Union(children.iter().map(|s| s.to_string()).collect())
}

fn ttu(tupleset: &str, computed: &str) -> RewriteRule {
    RewriteRule::TupleToUserset {
        tupleset: tupleset.to_string(),
        computed: computed.to_string(),
    }
}

/// Built-in `file` namespace.
///
/// Ownership and the editor/viewer ladder inherit down the `parent` chain,
/// which is what makes a grant on a directory reach every descendant when
/// the graph (not the bitmap) is consulted. Group grants route through
/// `member` on the target group. `execute` deliberately does not fold in
/// ownership.
pub fn file_schema() -> NamespaceSchema {
    NamespaceSchema::new("file")
        // owner ladder
        .relation("owner", union(&["direct_owner", "owner_via_group", "parent_owner"]))
        .relation("direct_owner", RewriteRule::Direct)
        .relation("owner_via_group", ttu("direct_owner", "member"))
        .relation("parent_owner", ttu("parent", "owner"))
        // editor ladder
        .relation(
            "editor",
            union(&["direct_editor", "editor_via_group", "owner", "parent_editor"]),
        )
        .relation("direct_editor", RewriteRule::Direct)
        .relation("editor_via_group", ttu("direct_editor", "member"))
        .relation("parent_editor", ttu("parent", "editor"))
        // viewer ladder; `reader` is the grant-facing synonym and stays a
        // direct edge so directory grants resolve by traversal too
        .relation(
            "viewer",
            union(&[
                "direct_viewer",
                "reader",
                "reader_via_group",
                "viewer_via_group",
                "editor",
                "parent_viewer",
            ]),
        )
        .relation("direct_viewer", RewriteRule::Direct)
        .relation("reader", RewriteRule::Direct)
        .relation("reader_via_group", ttu("reader", "member"))
        .relation("viewer_via_group", ttu("direct_viewer", "member"))
        .relation("parent_viewer", ttu("parent", "viewer"))
        // executor ladder, intentionally not reachable from owner
        .relation(
            "executor",
            union(&["direct_executor", "executor_via_group", "parent_executor"]),
        )
        .relation("direct_executor", RewriteRule::Direct)
        .relation("executor_via_group", ttu("direct_executor", "member"))
        .relation("parent_executor", ttu("parent", "executor"))
        // POSIX-style permission names resolve through the ladders
        .relation("read", union(&["viewer"]))
        .relation("write", union(&["editor"]))
        .relation("execute", union(&["executor"]))
}

/// Built-in `group` namespace: membership is a direct edge.
pub fn group_schema() -> NamespaceSchema {
    NamespaceSchema::new("group").relation("member", RewriteRule::Direct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_relation_is_direct() {
        let schema = file_schema();
        assert_eq!(schema.rule("bespoke"), RewriteRule::Direct);
    }

    #[test]
    fn read_resolves_through_viewer() {
        let schema = file_schema();
        match schema.rule("read") {
            RewriteRule::Union(children) => assert_eq!(children, vec!["viewer".to_string()]),
            other => panic!("unexpected rule {other:?}"),
        }
    }

    #[test]
    fn execute_does_not_include_owner() {
        let schema = file_schema();
        match schema.rule("execute") {
            RewriteRule::Union(children) => {
                assert!(!children.contains(&"owner".to_string()));
            }
            other => panic!("unexpected rule {other:?}"),
        }
    }
}
