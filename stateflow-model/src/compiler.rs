//! Two-pass model compiler.
//!
//! Pass one walks the document in document order, allocating one arena
//! slot and one [`DocumentId`] per node (states, transitions, invokes,
//! data items) and wiring parent/child back-references. Pass two resolves
//! textual identifiers - transition targets, initial attributes, history
//! defaults - to node references, failing with `UnresolvedTarget` when an
//! identifier is absent from the document. No node holds a reference to
//! another until the arena is complete; pass two mutates only the resolved
//! target fields.

use crate::document::{
    CompoundDocument, FinalDocument, HistoryDocument, ParallelDocument, StateDocument,
    StateMachineDocument,
};
use crate::error::ModelError;
use crate::node::{
    DataNode, DocumentId, FinalNode, HistoryNode, InvokeNode, Model, Node, ParallelNode,
    StateMachineNode, StateNode, TransitionNode,
};
use std::collections::HashMap;

/// Compiles a parsed document into an immutable model.
pub fn build(document: &StateMachineDocument) -> Result<Model, ModelError> {
    if document.states.is_empty() {
        return Err(ModelError::EmptyDocument);
    }

    let mut builder = Builder::default();
    builder.build_root(document)?;
    builder.resolve(document)?;

    let state_count = builder
        .nodes
        .iter()
        .filter(|n| matches!(n, Node::State(_) | Node::Parallel(_) | Node::Final(_)))
        .count();
    tracing::debug!(
        nodes = builder.nodes.len(),
        states = state_count,
        name = document.name.as_deref().unwrap_or(""),
        "model build complete"
    );

    Ok(Model {
        nodes: builder.nodes,
        root: DocumentId(0),
        state_ids: builder.state_ids,
        name: document.name.clone(),
    })
}

#[derive(Default)]
struct Builder {
    nodes: Vec<Node>,
    state_ids: HashMap<String, DocumentId>,
    /// (transition node, source state textual id, textual targets)
    pending_transitions: Vec<(DocumentId, String, Vec<String>)>,
    /// (history node, parent state textual id, textual default targets)
    pending_history: Vec<(DocumentId, String, Vec<String>)>,
    /// (state or machine node, owner textual id, textual initial ids)
    pending_initials: Vec<(DocumentId, String, Vec<String>)>,
}

impl Builder {
    /// Reserves an arena slot; the caller fills it once its fields are
    /// known. Children allocated during construction land after it, so
    /// ids stay in document (pre-)order.
    fn reserve(&mut self) -> DocumentId {
        let id = DocumentId(self.nodes.len() as u32);
        self.nodes.push(Node::Data(DataNode {
            id,
            parent: id,
            data_id: String::new(),
            expr: None,
        }));
        id
    }

    fn fill(&mut self, id: DocumentId, node: Node) {
        self.nodes[id.index()] = node;
    }

    fn register_state_id(&mut self, state_id: &str, id: DocumentId) -> Result<(), ModelError> {
        if self.state_ids.insert(state_id.to_string(), id).is_some() {
            return Err(ModelError::DuplicateStateId {
                id: state_id.to_string(),
            });
        }
        Ok(())
    }

    fn build_root(&mut self, document: &StateMachineDocument) -> Result<(), ModelError> {
        let root = self.reserve();

        let mut data = Vec::with_capacity(document.datamodel.len());
        for item in &document.datamodel {
            let id = self.reserve();
            self.fill(
                id,
                Node::Data(DataNode {
                    id,
                    parent: root,
                    data_id: item.id.clone(),
                    expr: item.expr.clone(),
                }),
            );
            data.push(id);
        }

        let mut children = Vec::with_capacity(document.states.len());
        for state in &document.states {
            let child = self.build_state(state, root)?;
            if !matches!(self.nodes[child.index()], Node::History(_)) {
                children.push(child);
            }
        }

        self.pending_initials.push((
            root,
            document.name.clone().unwrap_or_default(),
            document.initial.clone(),
        ));

        self.fill(
            root,
            Node::StateMachine(StateMachineNode {
                id: root,
                name: document.name.clone(),
                initial: Vec::new(),
                children,
                data,
            }),
        );
        Ok(())
    }

    fn build_state(
        &mut self,
        doc: &StateDocument,
        parent: DocumentId,
    ) -> Result<DocumentId, ModelError> {
        match doc {
            StateDocument::State(s) => self.build_compound(s, parent),
            StateDocument::Parallel(p) => self.build_parallel(p, parent),
            StateDocument::Final(f) => self.build_final(f, parent),
            StateDocument::History(h) => self.build_history(h, parent),
        }
    }

    fn build_compound(
        &mut self,
        doc: &CompoundDocument,
        parent: DocumentId,
    ) -> Result<DocumentId, ModelError> {
        let id = self.reserve();
        self.register_state_id(&doc.id, id)?;

        let data = self.build_data(&doc.datamodel, id);
        let invokes = self.build_invokes(&doc.invokes, &doc.id, id);
        let transitions = self.build_transitions(&doc.transitions, &doc.id, id);

        let mut children = Vec::new();
        let mut history = Vec::new();
        for child in &doc.states {
            let child_id = self.build_state(child, id)?;
            if matches!(self.nodes[child_id.index()], Node::History(_)) {
                history.push(child_id);
            } else {
                children.push(child_id);
            }
        }

        if !children.is_empty() {
            self.pending_initials
                .push((id, doc.id.clone(), doc.initial.clone()));
        }

        self.fill(
            id,
            Node::State(StateNode {
                id,
                state_id: doc.id.clone(),
                parent,
                initial: Vec::new(),
                children,
                transitions,
                invokes,
                history,
                data,
                on_entry: doc.on_entry.clone(),
                on_exit: doc.on_exit.clone(),
            }),
        );
        Ok(id)
    }

    fn build_parallel(
        &mut self,
        doc: &ParallelDocument,
        parent: DocumentId,
    ) -> Result<DocumentId, ModelError> {
        let id = self.reserve();
        self.register_state_id(&doc.id, id)?;

        let data = self.build_data(&doc.datamodel, id);
        let invokes = self.build_invokes(&doc.invokes, &doc.id, id);
        let transitions = self.build_transitions(&doc.transitions, &doc.id, id);

        let mut children = Vec::new();
        let mut history = Vec::new();
        for child in &doc.states {
            let child_id = self.build_state(child, id)?;
            if matches!(self.nodes[child_id.index()], Node::History(_)) {
                history.push(child_id);
            } else {
                children.push(child_id);
            }
        }

        self.fill(
            id,
            Node::Parallel(ParallelNode {
                id,
                state_id: doc.id.clone(),
                parent,
                children,
                transitions,
                invokes,
                history,
                data,
                on_entry: doc.on_entry.clone(),
                on_exit: doc.on_exit.clone(),
            }),
        );
        Ok(id)
    }

    fn build_final(
        &mut self,
        doc: &FinalDocument,
        parent: DocumentId,
    ) -> Result<DocumentId, ModelError> {
        let id = self.reserve();
        self.register_state_id(&doc.id, id)?;
        self.fill(
            id,
            Node::Final(FinalNode {
                id,
                state_id: doc.id.clone(),
                parent,
                on_entry: doc.on_entry.clone(),
                on_exit: doc.on_exit.clone(),
                done_data: doc.done_data.clone(),
            }),
        );
        Ok(id)
    }

    fn build_history(
        &mut self,
        doc: &HistoryDocument,
        parent: DocumentId,
    ) -> Result<DocumentId, ModelError> {
        if parent == DocumentId(0) {
            return Err(ModelError::HistoryOutsideCompound { id: doc.id.clone() });
        }
        let id = self.reserve();
        self.register_state_id(&doc.id, id)?;
        self.pending_history
            .push((id, doc.id.clone(), doc.targets.clone()));
        self.fill(
            id,
            Node::History(HistoryNode {
                id,
                state_id: doc.id.clone(),
                parent,
                deep: doc.deep,
                default_targets: Vec::new(),
            }),
        );
        Ok(id)
    }

    fn build_data(
        &mut self,
        items: &[crate::document::DataDocument],
        parent: DocumentId,
    ) -> Vec<DocumentId> {
        items
            .iter()
            .map(|item| {
                let id = self.reserve();
                self.fill(
                    id,
                    Node::Data(DataNode {
                        id,
                        parent,
                        data_id: item.id.clone(),
                        expr: item.expr.clone(),
                    }),
                );
                id
            })
            .collect()
    }

    fn build_invokes(
        &mut self,
        items: &[crate::document::InvokeDocument],
        state_id: &str,
        parent: DocumentId,
    ) -> Vec<DocumentId> {
        items
            .iter()
            .map(|item| {
                let id = self.reserve();
                let invoke_id = item
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{}.{}", state_id, id.as_u32()));
                self.fill(
                    id,
                    Node::Invoke(InvokeNode {
                        id,
                        parent,
                        invoke_id,
                        service_type: item.service_type.clone(),
                        src: item.src.clone(),
                        content: item.content.clone(),
                        params: item.params.clone(),
                        auto_forward: item.auto_forward,
                        finalize: item.finalize.clone(),
                    }),
                );
                id
            })
            .collect()
    }

    fn build_transitions(
        &mut self,
        items: &[crate::document::TransitionDocument],
        state_id: &str,
        parent: DocumentId,
    ) -> Vec<DocumentId> {
        items
            .iter()
            .map(|item| {
                let id = self.reserve();
                self.pending_transitions
                    .push((id, state_id.to_string(), item.targets.clone()));
                self.fill(
                    id,
                    Node::Transition(TransitionNode {
                        id,
                        parent,
                        events: item.events.clone(),
                        cond: item.cond.clone(),
                        targets: Vec::new(),
                        internal: item.internal,
                        actions: item.actions.clone(),
                    }),
                );
                id
            })
            .collect()
    }

    /// Pass two: fill in every resolved-reference field.
    fn resolve(&mut self, document: &StateMachineDocument) -> Result<(), ModelError> {
        let _ = document;

        let transitions = std::mem::take(&mut self.pending_transitions);
        for (id, source, targets) in transitions {
            let resolved = self.resolve_targets(&source, &targets)?;
            if let Node::Transition(t) = &mut self.nodes[id.index()] {
                t.targets = resolved;
            }
        }

        let history = std::mem::take(&mut self.pending_history);
        for (id, source, targets) in history {
            let resolved = self.resolve_targets(&source, &targets)?;
            if let Node::History(h) = &mut self.nodes[id.index()] {
                h.default_targets = resolved;
            }
        }

        let initials = std::mem::take(&mut self.pending_initials);
        for (id, owner, initial) in initials {
            let resolved = if initial.is_empty() {
                // Default initial: the first child state.
                let first = match &self.nodes[id.index()] {
                    Node::StateMachine(n) => n.children.first().copied(),
                    Node::State(n) => n.children.first().copied(),
                    _ => None,
                };
                first.into_iter().collect()
            } else {
                let resolved = self.resolve_targets(&owner, &initial)?;
                for &target in &resolved {
                    if !self.descends_from(target, id) {
                        return Err(ModelError::InvalidInitial {
                            state: owner.clone(),
                            target: self.textual_id(target),
                            reason: "initial target is not a descendant",
                        });
                    }
                }
                resolved
            };
            match &mut self.nodes[id.index()] {
                Node::StateMachine(n) => n.initial = resolved,
                Node::State(n) => n.initial = resolved,
                _ => {}
            }
        }

        Ok(())
    }

    fn resolve_targets(
        &self,
        source: &str,
        targets: &[String],
    ) -> Result<Vec<DocumentId>, ModelError> {
        targets
            .iter()
            .map(|target| {
                self.state_ids
                    .get(target)
                    .copied()
                    .ok_or_else(|| ModelError::UnresolvedTarget {
                        source: source.to_string(),
                        target: target.clone(),
                    })
            })
            .collect()
    }

    fn descends_from(&self, id: DocumentId, ancestor: DocumentId) -> bool {
        let mut current = self.nodes[id.index()].parent();
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.nodes[p.index()].parent();
        }
        false
    }

    fn textual_id(&self, id: DocumentId) -> String {
        self.nodes[id.index()]
            .state_id()
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(json: serde_json::Value) -> StateMachineDocument {
        serde_json::from_value(json).unwrap()
    }

    fn nested_doc() -> StateMachineDocument {
        doc(json!({
            "name": "m",
            "states": [
                {"kind": "state", "id": "a",
                 "initial": ["a2"],
                 "states": [
                     {"kind": "state", "id": "a1"},
                     {"kind": "state", "id": "a2",
                      "transitions": [{"events": ["go"], "targets": ["b"]}]},
                     {"kind": "history", "id": "ah", "targets": ["a1"]}
                 ]},
                {"kind": "final", "id": "b"}
            ]
        }))
    }

    #[test]
    fn ids_follow_document_order() {
        let model = build(&nested_doc()).unwrap();

        let a = model.state_by_id("a").unwrap();
        let a1 = model.state_by_id("a1").unwrap();
        let a2 = model.state_by_id("a2").unwrap();
        let b = model.state_by_id("b").unwrap();

        assert!(model.root() < a);
        assert!(a < a1);
        assert!(a1 < a2);
        assert!(a2 < b);
    }

    #[test]
    fn parent_child_backrefs() {
        let model = build(&nested_doc()).unwrap();
        let a = model.state_by_id("a").unwrap();
        let a1 = model.state_by_id("a1").unwrap();

        assert_eq!(model.parent(a1), Some(a));
        assert!(model.children(a).contains(&a1));
        assert!(model.is_descendant(a1, model.root()));
        assert!(!model.is_descendant(a, a1));
        assert_eq!(model.ancestors(a1), vec![a, model.root()]);
    }

    #[test]
    fn transition_targets_resolve() {
        let model = build(&nested_doc()).unwrap();
        let a2 = model.state_by_id("a2").unwrap();
        let b = model.state_by_id("b").unwrap();

        let t = model.transitions_of(a2)[0];
        let Node::Transition(transition) = model.node(t) else {
            panic!("expected transition");
        };
        assert_eq!(transition.targets, vec![b]);
        assert_eq!(transition.parent, a2);
    }

    #[test]
    fn explicit_and_default_initial() {
        let model = build(&nested_doc()).unwrap();
        let a = model.state_by_id("a").unwrap();
        let a2 = model.state_by_id("a2").unwrap();
        assert_eq!(model.initial_of(a), &[a2]);

        // Machine-level default: first child.
        assert_eq!(model.initial_of(model.root()), &[a]);
    }

    #[test]
    fn history_defaults_resolve() {
        let model = build(&nested_doc()).unwrap();
        let a = model.state_by_id("a").unwrap();
        let ah = model.state_by_id("ah").unwrap();
        let a1 = model.state_by_id("a1").unwrap();

        assert!(model.history_of(a).contains(&ah));
        let Node::History(h) = model.node(ah) else {
            panic!("expected history");
        };
        assert_eq!(h.default_targets, vec![a1]);
        // History is not a child state.
        assert!(!model.children(a).contains(&ah));
    }

    #[test]
    fn unresolved_target_fails_build() {
        let result = build(&doc(json!({
            "states": [
                {"kind": "state", "id": "a",
                 "transitions": [{"events": ["go"], "targets": ["missing"]}]}
            ]
        })));
        assert!(matches!(
            result,
            Err(ModelError::UnresolvedTarget { target, .. }) if target == "missing"
        ));
    }

    #[test]
    fn duplicate_state_id_fails_build() {
        let result = build(&doc(json!({
            "states": [
                {"kind": "state", "id": "a"},
                {"kind": "state", "id": "a"}
            ]
        })));
        assert!(matches!(result, Err(ModelError::DuplicateStateId { .. })));
    }

    #[test]
    fn empty_document_fails_build() {
        let result = build(&StateMachineDocument::default());
        assert!(matches!(result, Err(ModelError::EmptyDocument)));
    }

    #[test]
    fn invalid_initial_fails_build() {
        let result = build(&doc(json!({
            "states": [
                {"kind": "state", "id": "a",
                 "initial": ["b"],
                 "states": [{"kind": "state", "id": "a1"}]},
                {"kind": "state", "id": "b"}
            ]
        })));
        assert!(matches!(result, Err(ModelError::InvalidInitial { .. })));
    }

    #[test]
    fn history_under_root_fails_build() {
        let result = build(&doc(json!({
            "states": [{"kind": "history", "id": "h"}]
        })));
        assert!(matches!(
            result,
            Err(ModelError::HistoryOutsideCompound { .. })
        ));
    }

    #[test]
    fn invoke_nodes_get_ids_and_defaults() {
        let model = build(&doc(json!({
            "states": [
                {"kind": "state", "id": "s",
                 "invokes": [
                     {"type": "echo", "id": "named"},
                     {"type": "echo"}
                 ]}
            ]
        })))
        .unwrap();

        let s = model.state_by_id("s").unwrap();
        let invokes = model.invokes_of(s);
        assert_eq!(invokes.len(), 2);

        let Node::Invoke(named) = model.node(invokes[0]) else {
            panic!("expected invoke");
        };
        assert_eq!(named.invoke_id, "named");

        let Node::Invoke(auto) = model.node(invokes[1]) else {
            panic!("expected invoke");
        };
        assert!(auto.invoke_id.starts_with("s."));
    }

    #[test]
    fn atomic_and_compound_queries() {
        let model = build(&nested_doc()).unwrap();
        let a = model.state_by_id("a").unwrap();
        let a1 = model.state_by_id("a1").unwrap();
        let b = model.state_by_id("b").unwrap();

        assert!(model.is_compound(a));
        assert!(model.is_atomic(a1));
        assert!(model.is_atomic(b));
        assert!(model.is_final(b));
    }
}
