//! Compiled model nodes.
//!
//! A [`Model`] is an arena of immutable nodes indexed by [`DocumentId`].
//! Ids are assigned monotonically in document order, so comparing ids is
//! comparing document order; they are also the unit addressed by
//! checkpoint persistence. Parent/child back-references make
//! ancestor/descendant queries O(depth).

use crate::document::{ActionDocument, Expression, ParamDocument};
use std::collections::HashMap;
use std::fmt;

/// Stable document-order identifier of a compiled node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentId(pub u32);

impl DocumentId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A compiled model node.
#[derive(Debug)]
pub enum Node {
    StateMachine(StateMachineNode),
    State(StateNode),
    Parallel(ParallelNode),
    Final(FinalNode),
    History(HistoryNode),
    Transition(TransitionNode),
    Invoke(InvokeNode),
    Data(DataNode),
}

/// The document root.
#[derive(Debug)]
pub struct StateMachineNode {
    pub id: DocumentId,
    pub name: Option<String>,
    /// Resolved in pass two; defaults to the first child state.
    pub initial: Vec<DocumentId>,
    pub children: Vec<DocumentId>,
    pub data: Vec<DocumentId>,
}

/// An atomic or compound state.
#[derive(Debug)]
pub struct StateNode {
    pub id: DocumentId,
    pub state_id: String,
    pub parent: DocumentId,
    /// Resolved in pass two; defaults to the first child state. Empty for
    /// atomic states.
    pub initial: Vec<DocumentId>,
    pub children: Vec<DocumentId>,
    pub transitions: Vec<DocumentId>,
    pub invokes: Vec<DocumentId>,
    pub history: Vec<DocumentId>,
    pub data: Vec<DocumentId>,
    pub on_entry: Vec<ActionDocument>,
    pub on_exit: Vec<ActionDocument>,
}

/// A parallel state.
#[derive(Debug)]
pub struct ParallelNode {
    pub id: DocumentId,
    pub state_id: String,
    pub parent: DocumentId,
    pub children: Vec<DocumentId>,
    pub transitions: Vec<DocumentId>,
    pub invokes: Vec<DocumentId>,
    pub history: Vec<DocumentId>,
    pub data: Vec<DocumentId>,
    pub on_entry: Vec<ActionDocument>,
    pub on_exit: Vec<ActionDocument>,
}

/// A final state.
#[derive(Debug)]
pub struct FinalNode {
    pub id: DocumentId,
    pub state_id: String,
    pub parent: DocumentId,
    pub on_entry: Vec<ActionDocument>,
    pub on_exit: Vec<ActionDocument>,
    pub done_data: Option<Expression>,
}

/// A history pseudostate.
#[derive(Debug)]
pub struct HistoryNode {
    pub id: DocumentId,
    pub state_id: String,
    pub parent: DocumentId,
    pub deep: bool,
    /// Resolved in pass two.
    pub default_targets: Vec<DocumentId>,
}

/// A transition.
#[derive(Debug)]
pub struct TransitionNode {
    pub id: DocumentId,
    /// Source state entity (or the machine root for the initial
    /// transition).
    pub parent: DocumentId,
    /// Event descriptors; empty means eventless.
    pub events: Vec<String>,
    pub cond: Option<Expression>,
    /// Resolved in pass two; empty means targetless.
    pub targets: Vec<DocumentId>,
    pub internal: bool,
    pub actions: Vec<ActionDocument>,
}

/// An invoke declaration.
#[derive(Debug)]
pub struct InvokeNode {
    pub id: DocumentId,
    pub parent: DocumentId,
    /// Logical invoke id; auto-generated from the state id and document id
    /// when absent.
    pub invoke_id: String,
    pub service_type: String,
    pub src: Option<Expression>,
    pub content: Option<Expression>,
    pub params: Vec<ParamDocument>,
    pub auto_forward: bool,
    pub finalize: Vec<ActionDocument>,
}

/// A data-model declaration.
#[derive(Debug)]
pub struct DataNode {
    pub id: DocumentId,
    pub parent: DocumentId,
    pub data_id: String,
    pub expr: Option<Expression>,
}

impl Node {
    pub fn document_id(&self) -> DocumentId {
        match self {
            Node::StateMachine(n) => n.id,
            Node::State(n) => n.id,
            Node::Parallel(n) => n.id,
            Node::Final(n) => n.id,
            Node::History(n) => n.id,
            Node::Transition(n) => n.id,
            Node::Invoke(n) => n.id,
            Node::Data(n) => n.id,
        }
    }

    pub fn parent(&self) -> Option<DocumentId> {
        match self {
            Node::StateMachine(_) => None,
            Node::State(n) => Some(n.parent),
            Node::Parallel(n) => Some(n.parent),
            Node::Final(n) => Some(n.parent),
            Node::History(n) => Some(n.parent),
            Node::Transition(n) => Some(n.parent),
            Node::Invoke(n) => Some(n.parent),
            Node::Data(n) => Some(n.parent),
        }
    }

    /// Textual id for state entities.
    pub fn state_id(&self) -> Option<&str> {
        match self {
            Node::State(n) => Some(&n.state_id),
            Node::Parallel(n) => Some(&n.state_id),
            Node::Final(n) => Some(&n.state_id),
            Node::History(n) => Some(&n.state_id),
            _ => None,
        }
    }
}

/// The compiled, immutable statechart model.
#[derive(Debug)]
pub struct Model {
    pub(crate) nodes: Vec<Node>,
    pub(crate) root: DocumentId,
    pub(crate) state_ids: HashMap<String, DocumentId>,
    pub(crate) name: Option<String>,
}

impl Model {
    pub fn root(&self) -> DocumentId {
        self.root
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: DocumentId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Looks up a state entity by its textual id.
    pub fn state_by_id(&self, state_id: &str) -> Option<DocumentId> {
        self.state_ids.get(state_id).copied()
    }

    pub fn parent(&self, id: DocumentId) -> Option<DocumentId> {
        self.node(id).parent()
    }

    /// Textual id of a state entity, or its document id rendered as text.
    pub fn state_id(&self, id: DocumentId) -> String {
        self.node(id)
            .state_id()
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string())
    }

    pub fn is_state_entity(&self, id: DocumentId) -> bool {
        matches!(
            self.node(id),
            Node::State(_) | Node::Parallel(_) | Node::Final(_)
        )
    }

    pub fn is_compound(&self, id: DocumentId) -> bool {
        matches!(self.node(id), Node::State(n) if !n.children.is_empty())
    }

    pub fn is_parallel(&self, id: DocumentId) -> bool {
        matches!(self.node(id), Node::Parallel(_))
    }

    pub fn is_final(&self, id: DocumentId) -> bool {
        matches!(self.node(id), Node::Final(_))
    }

    pub fn is_history(&self, id: DocumentId) -> bool {
        matches!(self.node(id), Node::History(_))
    }

    /// Atomic: a state with no children, or a final state.
    pub fn is_atomic(&self, id: DocumentId) -> bool {
        match self.node(id) {
            Node::State(n) => n.children.is_empty(),
            Node::Final(_) => true,
            _ => false,
        }
    }

    /// Child state entities (excluding history pseudostates).
    pub fn children(&self, id: DocumentId) -> &[DocumentId] {
        match self.node(id) {
            Node::StateMachine(n) => &n.children,
            Node::State(n) => &n.children,
            Node::Parallel(n) => &n.children,
            _ => &[],
        }
    }

    pub fn transitions_of(&self, id: DocumentId) -> &[DocumentId] {
        match self.node(id) {
            Node::State(n) => &n.transitions,
            Node::Parallel(n) => &n.transitions,
            _ => &[],
        }
    }

    pub fn invokes_of(&self, id: DocumentId) -> &[DocumentId] {
        match self.node(id) {
            Node::State(n) => &n.invokes,
            Node::Parallel(n) => &n.invokes,
            _ => &[],
        }
    }

    pub fn history_of(&self, id: DocumentId) -> &[DocumentId] {
        match self.node(id) {
            Node::State(n) => &n.history,
            Node::Parallel(n) => &n.history,
            _ => &[],
        }
    }

    pub fn initial_of(&self, id: DocumentId) -> &[DocumentId] {
        match self.node(id) {
            Node::StateMachine(n) => &n.initial,
            Node::State(n) => &n.initial,
            _ => &[],
        }
    }

    pub fn on_entry_of(&self, id: DocumentId) -> &[ActionDocument] {
        match self.node(id) {
            Node::State(n) => &n.on_entry,
            Node::Parallel(n) => &n.on_entry,
            Node::Final(n) => &n.on_entry,
            _ => &[],
        }
    }

    pub fn on_exit_of(&self, id: DocumentId) -> &[ActionDocument] {
        match self.node(id) {
            Node::State(n) => &n.on_exit,
            Node::Parallel(n) => &n.on_exit,
            Node::Final(n) => &n.on_exit,
            _ => &[],
        }
    }

    /// All data declarations, machine-level first then per-state in
    /// document order.
    pub fn data_nodes(&self) -> impl Iterator<Item = &DataNode> {
        self.nodes.iter().filter_map(|n| match n {
            Node::Data(d) => Some(d),
            _ => None,
        })
    }

    /// True when `id` is a strict descendant of `ancestor`.
    pub fn is_descendant(&self, id: DocumentId, ancestor: DocumentId) -> bool {
        let mut current = self.parent(id);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parent(p);
        }
        false
    }

    /// Ancestors of `id` from its parent up to and including the root.
    pub fn ancestors(&self, id: DocumentId) -> Vec<DocumentId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(p) = current {
            out.push(p);
            current = self.parent(p);
        }
        out
    }

    /// Least common compound ancestor of a set of states: the closest
    /// ancestor that is a compound state or the machine root.
    pub fn least_common_ancestor(&self, ids: &[DocumentId]) -> DocumentId {
        debug_assert!(!ids.is_empty());
        let first = ids[0];
        for candidate in self.ancestors(first) {
            if !self.is_compound(candidate) && candidate != self.root {
                continue;
            }
            if ids
                .iter()
                .all(|&id| self.is_descendant(id, candidate))
            {
                return candidate;
            }
        }
        self.root
    }
}
