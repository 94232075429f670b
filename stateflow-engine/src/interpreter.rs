//! The statechart interpreter.
//!
//! A single-owner step loop over interpreter phases:
//!
//! ```text
//! Initial -> Stable -> SelectingTransitions -> Microstep -> (loop) -> Final
//! ```
//!
//! One microstep is an atomic exit/transition/entry cycle for one
//! consistent set of enabled transitions; a macrostep runs microsteps
//! (eventless transitions first, then internal events) until the
//! configuration is stable. Invoked services start at stable points and
//! the interpreter suspends on the external queue until the next event,
//! a cancellation, or a top-level final state ends the run.
//!
//! The configuration, data model, and history map are owned by the loop
//! and never locked; only the event queue, delayed sends, and the
//! checkpoint log are touched from other tasks.

use crate::action::{execute_block, ActionScope, PendingSends};
use crate::build::CompiledModel;
use crate::datamodel::DataModel;
use crate::error::{RunError, UnhandledErrorBehaviour};
use crate::event::{descriptor_matches, Event, EventKind};
use crate::invoke::{InvokeManager, ServiceFactory, StartInvoke};
use crate::persist;
use crate::queue::{EventQueue, EventSender};
use stateflow_checkpoint::CheckpointLog;
use stateflow_model::{DocumentId, Node};
use stateflow_value::{Obj, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// When the interpreter writes a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointGranularity {
    /// After every microstep.
    EveryMicrostep,
    /// At every stable point (end of macrostep).
    #[default]
    EveryMacrostep,
    /// Never automatically.
    Never,
}

/// Tunable run behavior.
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    pub unhandled_error: UnhandledErrorBehaviour,
    pub checkpoint: CheckpointGranularity,
    /// Livelock guard: abort when one macrostep runs this many
    /// microsteps without stabilizing.
    pub max_microsteps: u32,
    /// Session id; auto-generated when absent.
    pub session_id: Option<String>,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            unhandled_error: UnhandledErrorBehaviour::default(),
            checkpoint: CheckpointGranularity::default(),
            max_microsteps: 1024,
            session_id: None,
        }
    }
}

/// Cancels a running interpreter from outside the step loop.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    /// Requests cancellation. The loop stops before its next microstep.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    async fn cancelled(&self) {
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Stable,
    SelectingTransitions,
    Microstep,
    Final,
}

/// One statechart session.
pub struct Interpreter {
    compiled: Arc<CompiledModel>,
    options: InterpreterOptions,
    data: DataModel,
    configuration: BTreeSet<DocumentId>,
    /// Recorded configurations keyed by history node.
    history: HashMap<DocumentId, Vec<DocumentId>>,
    /// States entered but whose invokes have not started yet.
    states_to_invoke: BTreeSet<DocumentId>,
    queue: EventQueue,
    invokes: InvokeManager,
    sends: PendingSends,
    checkpoint: Option<Arc<dyn CheckpointLog>>,
    cancel: CancelHandle,
    phase: Phase,
    final_value: Value,
    session_id: String,
    /// Logical invoke id -> invoke node, for finalize lookup.
    invoke_nodes: HashMap<String, DocumentId>,
}

impl Interpreter {
    pub fn new(compiled: Arc<CompiledModel>, factory: Arc<dyn ServiceFactory>) -> Self {
        let invoke_nodes = compiled
            .model()
            .nodes()
            .filter_map(|n| match n {
                Node::Invoke(i) => Some((i.invoke_id.clone(), i.id)),
                _ => None,
            })
            .collect();
        Self {
            compiled,
            options: InterpreterOptions::default(),
            data: DataModel::new(),
            configuration: BTreeSet::new(),
            history: HashMap::new(),
            states_to_invoke: BTreeSet::new(),
            queue: EventQueue::new(),
            invokes: InvokeManager::new(factory),
            sends: PendingSends::new(),
            checkpoint: None,
            cancel: CancelHandle::default(),
            phase: Phase::Initial,
            final_value: Value::Undefined,
            session_id: String::new(),
            invoke_nodes,
        }
    }

    pub fn with_options(mut self, options: InterpreterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_checkpoint(mut self, log: Arc<dyn CheckpointLog>) -> Self {
        self.checkpoint = Some(log);
        self
    }

    /// Writer handle for feeding external events while the run is in
    /// progress.
    pub fn sender(&self) -> EventSender {
        self.queue.sender()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// The active configuration. Empty until the run enters its initial
    /// states.
    pub fn configuration(&self) -> &BTreeSet<DocumentId> {
        &self.configuration
    }

    /// Rebuilds a session from the last snapshot in `log`. Interrupted
    /// invokes restart with fresh unique suffixes when their states are
    /// still active.
    pub fn restore(
        compiled: Arc<CompiledModel>,
        factory: Arc<dyn ServiceFactory>,
        log: Arc<dyn CheckpointLog>,
    ) -> Result<Self, RunError> {
        let restored = persist::load(log.as_ref())?
            .ok_or_else(|| RunError::Platform("checkpoint log is empty".to_string()))?;

        let mut interpreter = Self::new(compiled, factory).with_checkpoint(log);
        for &id in &restored.configuration {
            if id.index() >= interpreter.compiled.model().len()
                || !interpreter.compiled.model().is_state_entity(id)
            {
                return Err(RunError::Platform(format!(
                    "checkpointed configuration references {id}, which is not a state"
                )));
            }
        }
        interpreter.configuration = restored.configuration;
        if let Some(root) = restored.root {
            interpreter.data = DataModel::from_root(root);
        }
        for (_, _, state) in restored.invokes {
            if interpreter.configuration.contains(&state) {
                interpreter.states_to_invoke.insert(state);
            }
        }
        interpreter.phase = Phase::Stable;
        interpreter.session_id = interpreter
            .data
            .get("_sessionid")
            .as_string_or_default()
            .to_string();

        tracing::info!(
            session = %interpreter.session_id,
            states = interpreter.configuration.len(),
            "session restored from checkpoint"
        );
        Ok(interpreter)
    }

    /// Runs a fresh session to completion. Resolves with the final
    /// state's done-data once a top-level final state is reached.
    pub async fn run(mut self, initial_data: Value) -> Result<Value, RunError> {
        self.initialize(initial_data);
        self.enter_initial_configuration()?;
        self.run_loop().await
    }

    /// Continues a restored session.
    pub async fn resume(mut self) -> Result<Value, RunError> {
        if self.phase == Phase::Initial {
            return Err(RunError::Platform(
                "resume called on a session that never started".to_string(),
            ));
        }
        self.run_loop().await
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    fn initialize(&mut self, initial_data: Value) {
        self.session_id = self
            .options
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        // Early binding: every declared data item initializes now, in
        // document order. Evaluation failures become error.execution.
        let data_nodes: Vec<DocumentId> =
            self.compiled.model().data_nodes().map(|d| d.id).collect();
        for id in data_nodes {
            let Node::Data(node) = self.compiled.model().node(id) else {
                continue;
            };
            let data_id = node.data_id.clone();
            let value = match self.compiled.data_expr(id) {
                Some(expr) => match expr.evaluate(&self.data) {
                    Ok(value) => value,
                    Err(error) => {
                        tracing::warn!(%error, data_id, "data initialization failed");
                        self.queue
                            .push_internal(Event::error_execution(error.to_string()));
                        Value::Undefined
                    }
                },
                None => Value::Undefined,
            };
            let _ = self.data.declare(&data_id, value);
        }

        // Caller-supplied initial data overrides declarations.
        if let Value::Object(obj) = initial_data.resolve() {
            for entry in obj.entries() {
                if let Some(key) = entry.key {
                    let _ = self.data.declare(&key, entry.value);
                }
            }
        }

        let name = self.compiled.model().name().unwrap_or_default();
        self.data.set_system("_name", Value::from(name));
        self.data
            .set_system("_sessionid", Value::from(self.session_id.clone()));

        tracing::info!(session = %self.session_id, name, "session starting");
    }

    fn enter_initial_configuration(&mut self) -> Result<(), RunError> {
        let model = self.compiled.model();
        let root = model.root();
        let targets: Vec<DocumentId> = model.initial_of(root).to_vec();

        let mut entry_set = BTreeSet::new();
        for &target in &targets {
            self.add_descendants_to_enter(target, &mut entry_set);
        }
        for &target in &targets {
            self.add_ancestors_to_enter(target, root, &mut entry_set);
        }
        self.enter_states(&entry_set)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    async fn run_loop(mut self) -> Result<Value, RunError> {
        loop {
            self.macrostep()?;

            if self.phase == Phase::Final {
                return self.finish();
            }

            self.phase = Phase::Stable;
            self.start_pending_invokes();
            if self.options.checkpoint != CheckpointGranularity::Never {
                self.write_checkpoint()?;
            }

            if self.cancel.is_cancelled() {
                return self.finish_cancelled();
            }
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return self.finish_cancelled(),
                event = self.queue.next() => event,
            };
            let Some(event) = event else {
                return Err(RunError::Platform(
                    "external event channel closed".to_string(),
                ));
            };
            self.process_event(event)?;
        }
    }

    /// Runs microsteps until the configuration is stable: eventless
    /// transitions first, then internal events, repeated.
    fn macrostep(&mut self) -> Result<(), RunError> {
        let mut steps = 0u32;
        loop {
            if self.phase == Phase::Final || self.cancel.is_cancelled() {
                return Ok(());
            }

            self.phase = Phase::SelectingTransitions;
            let eventless = self.select_transitions(None);
            if !eventless.is_empty() {
                steps += 1;
                if steps > self.options.max_microsteps {
                    return Err(RunError::Platform(format!(
                        "macrostep exceeded {} microsteps without stabilizing",
                        self.options.max_microsteps
                    )));
                }
                self.microstep(&eventless)?;
                continue;
            }

            let Some(event) = self.queue.pop_internal() else {
                return Ok(());
            };
            steps += 1;
            if steps > self.options.max_microsteps {
                return Err(RunError::Platform(format!(
                    "macrostep exceeded {} microsteps without stabilizing",
                    self.options.max_microsteps
                )));
            }
            self.process_event(event)?;
        }
    }

    fn process_event(&mut self, event: Event) -> Result<(), RunError> {
        tracing::debug!(name = %event.name, kind = ?event.kind, "processing event");
        self.data.set_system("_event", event_record(&event));

        // Finalize actions of the owning invoke run before selection.
        if let Some(unique) = &event.invoke_id {
            if let Some(logical) = self.invokes.logical_for(unique) {
                self.run_finalize(&logical);
            }
        }
        if event.kind == EventKind::External {
            self.invokes.forward(&event);
        }

        let selected = self.select_transitions(Some(&event));
        if selected.is_empty() {
            if event.is_error() {
                match self.options.unhandled_error {
                    UnhandledErrorBehaviour::Ignore => {
                        tracing::warn!(name = %event.name, data = %event.data.to_display_string(),
                            "unhandled error event ignored");
                    }
                    UnhandledErrorBehaviour::HaltStateMachine => {
                        return Err(RunError::UnhandledError { event: event.name });
                    }
                }
            }
            return Ok(());
        }
        self.microstep(&selected)
    }

    fn run_finalize(&mut self, logical: &str) {
        let Some(&invoke_id) = self.invoke_nodes.get(logical) else {
            return;
        };
        let compiled = self.compiled.clone();
        let Some(resolved) = compiled.invoke_of(invoke_id) else {
            return;
        };
        if !resolved.finalize.is_empty() {
            self.execute_actions(&resolved.finalize);
        }
    }

    // ------------------------------------------------------------------
    // Transition selection
    // ------------------------------------------------------------------

    /// Enabled transitions for an event (or eventless when `None`):
    /// for each active atomic state, the first matching transition on
    /// itself or an ancestor; conflicts resolved descendant-wins.
    fn select_transitions(&self, event: Option<&Event>) -> Vec<DocumentId> {
        let model = self.compiled.model();
        let mut selected: Vec<DocumentId> = Vec::new();

        let atomics: Vec<DocumentId> = self
            .configuration
            .iter()
            .copied()
            .filter(|&id| model.is_atomic(id))
            .collect();

        for leaf in atomics {
            let mut chain = vec![leaf];
            chain.extend(model.ancestors(leaf));
            'leaf: for state in chain {
                for &t in model.transitions_of(state) {
                    if self.transition_enabled(t, event) {
                        if !selected.contains(&t) {
                            selected.push(t);
                        }
                        break 'leaf;
                    }
                }
            }
        }

        // Descendant pre-empts ancestor: drop a transition when another
        // selected transition's source is a strict descendant of its
        // source.
        let sources: Vec<DocumentId> = selected
            .iter()
            .map(|&t| model.parent(t).unwrap_or(model.root()))
            .collect();
        let mut kept: Vec<DocumentId> = selected
            .iter()
            .copied()
            .enumerate()
            .filter(|&(i, _)| {
                !sources
                    .iter()
                    .enumerate()
                    .any(|(j, &other)| i != j && model.is_descendant(other, sources[i]))
            })
            .map(|(_, t)| t)
            .collect();
        kept.sort();
        kept
    }

    fn transition_enabled(&self, transition: DocumentId, event: Option<&Event>) -> bool {
        let Node::Transition(t) = self.compiled.model().node(transition) else {
            return false;
        };
        let event_ok = match event {
            None => t.events.is_empty(),
            Some(event) => t
                .events
                .iter()
                .any(|descriptor| descriptor_matches(descriptor, &event.name)),
        };
        if !event_ok {
            return false;
        }
        match self.compiled.condition_of(transition) {
            None => true,
            Some(cond) => match cond.evaluate(&self.data) {
                Ok(enabled) => enabled,
                Err(error) => {
                    // A broken guard must not block sibling transitions.
                    tracing::warn!(%error, "guard evaluation failed, treating as false");
                    false
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // Microstep
    // ------------------------------------------------------------------

    fn microstep(&mut self, transitions: &[DocumentId]) -> Result<(), RunError> {
        self.phase = Phase::Microstep;
        let compiled = self.compiled.clone();

        let exit_set = self.compute_exit_set(transitions);
        let entry_set = self.compute_entry_set(transitions);
        tracing::trace!(
            exits = exit_set.len(),
            entries = entry_set.len(),
            transitions = transitions.len(),
            "microstep"
        );

        // Exit deepest-first (reverse document order).
        for &state in exit_set.iter().rev() {
            self.record_history(state);
        }
        for &state in exit_set.iter().rev() {
            self.execute_actions(compiled.exit_actions(state));
            self.invokes.cancel_for_state(state);
            self.states_to_invoke.remove(&state);
            self.configuration.remove(&state);
        }

        for &t in transitions {
            self.execute_actions(compiled.transition_actions(t));
        }

        self.enter_states(&entry_set)?;

        if self.options.checkpoint == CheckpointGranularity::EveryMicrostep {
            self.write_checkpoint()?;
        }
        Ok(())
    }

    /// States exited by this set of transitions: every active descendant
    /// of each transition's domain.
    fn compute_exit_set(&self, transitions: &[DocumentId]) -> BTreeSet<DocumentId> {
        let model = self.compiled.model();
        let mut exit_set = BTreeSet::new();
        for &t in transitions {
            let Some(domain) = self.transition_domain(t) else {
                continue;
            };
            for &state in &self.configuration {
                if model.is_descendant(state, domain) {
                    exit_set.insert(state);
                }
            }
        }
        exit_set
    }

    /// The transition's domain: its source for an internal transition
    /// whose targets all sit beneath the source, otherwise the least
    /// common compound ancestor of source and targets. `None` for a
    /// targetless transition (no exit/entry at all).
    fn transition_domain(&self, transition: DocumentId) -> Option<DocumentId> {
        let model = self.compiled.model();
        let Node::Transition(t) = model.node(transition) else {
            return None;
        };
        if t.targets.is_empty() {
            return None;
        }
        let source = t.parent;
        let anchored: Vec<DocumentId> = t.targets.iter().map(|&x| self.anchor(x)).collect();

        if t.internal
            && model.is_compound(source)
            && anchored.iter().all(|&x| model.is_descendant(x, source))
        {
            return Some(source);
        }
        let mut ids = vec![source];
        ids.extend(anchored);
        Some(model.least_common_ancestor(&ids))
    }

    /// History targets anchor at their parent for domain computation.
    fn anchor(&self, target: DocumentId) -> DocumentId {
        let model = self.compiled.model();
        if model.is_history(target) {
            model.parent(target).unwrap_or(target)
        } else {
            target
        }
    }

    fn compute_entry_set(&self, transitions: &[DocumentId]) -> BTreeSet<DocumentId> {
        let model = self.compiled.model();
        let mut entry_set = BTreeSet::new();
        for &t in transitions {
            let Some(domain) = self.transition_domain(t) else {
                continue;
            };
            let Node::Transition(node) = model.node(t) else {
                continue;
            };
            for &target in &node.targets {
                self.add_descendants_to_enter(target, &mut entry_set);
            }
            for &target in &node.targets {
                self.add_ancestors_to_enter(self.anchor(target), domain, &mut entry_set);
            }
        }
        entry_set
    }

    fn add_descendants_to_enter(&self, id: DocumentId, entry_set: &mut BTreeSet<DocumentId>) {
        let model = self.compiled.model();
        match model.node(id) {
            Node::History(h) => {
                let targets = self
                    .history
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| h.default_targets.clone());
                let parent = h.parent;
                for &target in &targets {
                    self.add_descendants_to_enter(target, entry_set);
                }
                for &target in &targets {
                    self.add_ancestors_to_enter(target, parent, entry_set);
                }
            }
            Node::Parallel(p) => {
                entry_set.insert(id);
                for &child in &p.children {
                    self.add_descendants_to_enter(child, entry_set);
                }
            }
            Node::State(s) if !s.children.is_empty() => {
                entry_set.insert(id);
                for &target in &s.initial {
                    self.add_descendants_to_enter(target, entry_set);
                }
                for &target in &s.initial {
                    self.add_ancestors_to_enter(target, id, entry_set);
                }
            }
            _ => {
                entry_set.insert(id);
            }
        }
    }

    /// Adds the proper ancestors of `id` below `domain` (exclusive),
    /// filling in sibling regions of any parallel ancestor.
    fn add_ancestors_to_enter(
        &self,
        id: DocumentId,
        domain: DocumentId,
        entry_set: &mut BTreeSet<DocumentId>,
    ) {
        let model = self.compiled.model();
        for ancestor in model.ancestors(id) {
            if ancestor == domain || ancestor == model.root() {
                break;
            }
            entry_set.insert(ancestor);
            if model.is_parallel(ancestor) {
                for &child in model.children(ancestor) {
                    let covered = entry_set
                        .iter()
                        .any(|&e| e == child || model.is_descendant(e, child));
                    if !covered {
                        self.add_descendants_to_enter(child, entry_set);
                    }
                }
            }
        }
    }

    fn enter_states(&mut self, entry_set: &BTreeSet<DocumentId>) -> Result<(), RunError> {
        // Document order.
        for &state in entry_set {
            if !self.configuration.insert(state) {
                continue;
            }
            let compiled = self.compiled.clone();
            self.execute_actions(compiled.entry_actions(state));
            if !compiled.model().invokes_of(state).is_empty() {
                self.states_to_invoke.insert(state);
            }
            if compiled.model().is_final(state) {
                self.entered_final(state)?;
            }
        }
        Ok(())
    }

    fn entered_final(&mut self, state: DocumentId) -> Result<(), RunError> {
        let done_data = self.evaluate_done_data(state);
        let model = self.compiled.model();
        let Some(parent) = model.parent(state) else {
            return Ok(());
        };

        if parent == model.root() {
            // Top-level final: the run completes with this done-data.
            self.final_value = done_data;
            self.phase = Phase::Final;
            return Ok(());
        }

        let parent_id = model.state_id(parent);
        self.queue
            .push_internal(Event::done_state(&parent_id, done_data));

        if let Some(grandparent) = model.parent(parent) {
            if model.is_parallel(grandparent)
                && model
                    .children(grandparent)
                    .iter()
                    .all(|&region| self.in_final_state(region))
            {
                let grandparent_id = model.state_id(grandparent);
                self.queue
                    .push_internal(Event::done_state(&grandparent_id, Value::Undefined));
            }
        }
        Ok(())
    }

    fn evaluate_done_data(&mut self, state: DocumentId) -> Value {
        match self.compiled.done_data_of(state) {
            None => Value::Undefined,
            Some(expr) => match expr.evaluate(&self.data) {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(%error, "done-data evaluation failed");
                    self.queue
                        .push_internal(Event::error_execution(error.to_string()));
                    Value::Undefined
                }
            },
        }
    }

    /// A compound state is "in a final state" when one of its final
    /// children is active; a parallel state when all regions are.
    fn in_final_state(&self, state: DocumentId) -> bool {
        let model = self.compiled.model();
        if model.is_parallel(state) {
            return model
                .children(state)
                .iter()
                .all(|&child| self.in_final_state(child));
        }
        model
            .children(state)
            .iter()
            .any(|&child| model.is_final(child) && self.configuration.contains(&child))
    }

    fn record_history(&mut self, state: DocumentId) {
        let model = self.compiled.model();
        for &h in model.history_of(state) {
            let Node::History(node) = model.node(h) else {
                continue;
            };
            let snapshot: Vec<DocumentId> = if node.deep {
                self.configuration
                    .iter()
                    .copied()
                    .filter(|&c| model.is_atomic(c) && model.is_descendant(c, state))
                    .collect()
            } else {
                self.configuration
                    .iter()
                    .copied()
                    .filter(|&c| model.parent(c) == Some(state))
                    .collect()
            };
            tracing::trace!(history = %model.state_id(h), states = snapshot.len(), "history recorded");
            self.history.insert(h, snapshot);
        }
    }

    // ------------------------------------------------------------------
    // Actions and invokes
    // ------------------------------------------------------------------

    /// Executes an action block; a failure stops the block and becomes
    /// an `error.execution` event on the internal queue.
    fn execute_actions(&mut self, actions: &[crate::action::CompiledAction]) {
        if actions.is_empty() {
            return;
        }
        let sender = self.queue.sender();
        let mut scope = ActionScope {
            data: &self.data,
            queue: &mut self.queue,
            sender: &sender,
            invokes: &self.invokes,
            sends: &self.sends,
        };
        if let Err(error) = execute_block(actions, &mut scope) {
            tracing::warn!(%error, "action block failed");
            self.queue
                .push_internal(Event::error_execution(error.to_string()));
        }
    }

    /// Starts invokes for states entered since the last stable point,
    /// in document order of their containing states.
    fn start_pending_invokes(&mut self) {
        let states: Vec<DocumentId> = std::mem::take(&mut self.states_to_invoke)
            .into_iter()
            .filter(|s| self.configuration.contains(s))
            .collect();
        for state in states {
            let compiled = self.compiled.clone();
            for &invoke in compiled.model().invokes_of(state) {
                if let Err(error) = self.start_invoke(state, invoke) {
                    tracing::warn!(%error, "invoke failed to start");
                }
            }
        }
    }

    fn start_invoke(&mut self, state: DocumentId, invoke: DocumentId) -> Result<(), RunError> {
        let compiled = self.compiled.clone();
        let Node::Invoke(node) = compiled.model().node(invoke) else {
            return Ok(());
        };
        let Some(resolved) = compiled.invoke_of(invoke) else {
            return Ok(());
        };

        let mut spec = StartInvoke::new(&node.invoke_id, &node.service_type, state);
        spec.auto_forward = node.auto_forward;
        let evaluate = |expr: &Option<Arc<dyn crate::binding::ValueEvaluator>>| {
            expr.as_ref()
                .map(|e| e.evaluate(&self.data))
                .transpose()
                .map(|v| v.unwrap_or_default())
        };
        match (
            evaluate(&resolved.src),
            evaluate(&resolved.content),
            self.evaluate_params(&resolved.params),
        ) {
            (Ok(src), Ok(content), Ok(params)) => {
                spec.src = src;
                spec.content = content;
                spec.params = params;
            }
            (src, content, params) => {
                let error = [
                    src.err().map(|e| e.to_string()),
                    content.err().map(|e| e.to_string()),
                    params.err().map(|e| e.to_string()),
                ]
                .into_iter()
                .flatten()
                .next()
                .unwrap_or_default();
                self.queue.push_internal(Event::error_execution(error));
                return Ok(());
            }
        }

        let sender = self.queue.sender();
        if let Err(error) = self.invokes.start(spec, &sender) {
            self.queue.push_internal(Event::error_communication(
                &node.invoke_id,
                error.to_string(),
            ));
        }
        Ok(())
    }

    fn evaluate_params(
        &self,
        params: &[(String, Arc<dyn crate::binding::ValueEvaluator>)],
    ) -> Result<Value, crate::error::ExecutionError> {
        if params.is_empty() {
            return Ok(Value::Undefined);
        }
        let obj = Obj::new();
        for (name, expr) in params {
            let value = expr.evaluate(&self.data)?;
            obj.add(name.as_str(), value)?;
        }
        Ok(Value::from(obj))
    }

    // ------------------------------------------------------------------
    // Checkpoint and completion
    // ------------------------------------------------------------------

    fn write_checkpoint(&self) -> Result<(), RunError> {
        let Some(log) = &self.checkpoint else {
            return Ok(());
        };
        persist::save(log.as_ref(), &self.configuration, &self.data, &self.invokes)
    }

    fn finish(mut self) -> Result<Value, RunError> {
        self.invokes.cancel_all();
        self.sends.cancel_all();
        if self.options.checkpoint != CheckpointGranularity::Never {
            self.write_checkpoint()?;
        }
        tracing::info!(session = %self.session_id, value = %self.final_value.to_display_string(),
            "session completed");
        Ok(std::mem::take(&mut self.final_value))
    }

    fn finish_cancelled(self) -> Result<Value, RunError> {
        self.invokes.cancel_all();
        self.sends.cancel_all();
        tracing::info!(session = %self.session_id, "session cancelled");
        Err(RunError::Cancelled)
    }
}

/// Builds the `_event` system variable record.
fn event_record(event: &Event) -> Value {
    let record = Obj::new();
    let _ = record.add("name", event.name.as_str());
    let _ = record.add(
        "type",
        match event.kind {
            EventKind::Platform => "platform",
            EventKind::Internal => "internal",
            EventKind::External => "external",
        },
    );
    let _ = record.add("data", event.data.clone());
    if let Some(origin) = &event.origin {
        let _ = record.add("origin", origin.as_str());
    }
    if let Some(send_id) = &event.send_id {
        let _ = record.add("sendid", send_id.as_str());
    }
    if let Some(invoke_id) = &event.invoke_id {
        let _ = record.add("invokeid", invoke_id.as_str());
    }
    Value::from(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BasicBinding;
    use crate::build::build_model;
    use crate::invoke::ServiceRegistry;
    use serde_json::json;
    use stateflow_checkpoint::{FileLog, LogConfig, MemoryLog};
    use stateflow_model::StateMachineDocument;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn compile(doc: serde_json::Value) -> Arc<CompiledModel> {
        let document: StateMachineDocument = serde_json::from_value(doc).unwrap();
        Arc::new(build_model(&document, &BasicBinding).unwrap())
    }

    fn session(doc: serde_json::Value) -> Interpreter {
        Interpreter::new(compile(doc), Arc::new(ServiceRegistry::new()))
    }

    async fn finished(handle: JoinHandle<Result<Value, RunError>>) -> Result<Value, RunError> {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not complete")
            .expect("run task panicked")
    }

    /// Lets a spawned session drain its queues on a current-thread
    /// runtime.
    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn runs_to_top_level_final_with_done_data() {
        let interp = session(json!({
            "states": [
                {"kind": "state", "id": "idle",
                 "transitions": [{"events": ["go"], "targets": ["end"]}]},
                {"kind": "final", "id": "end", "done_data": "'completed'"}
            ]
        }));
        let sender = interp.sender();
        let handle = tokio::spawn(interp.run(Value::Undefined));

        sender.send(Event::external("go")).unwrap();
        assert_eq!(finished(handle).await.unwrap(), Value::from("completed"));
    }

    #[tokio::test]
    async fn initial_data_overrides_declarations() {
        let doc = json!({
            "datamodel": [{"id": "mode", "expr": "'default'"}],
            "states": [
                {"kind": "state", "id": "a", "transitions": [
                    {"events": ["go"], "cond": "mode == 'override'", "targets": ["yes"]},
                    {"events": ["go"], "targets": ["no"]}
                ]},
                {"kind": "final", "id": "yes", "done_data": "'override'"},
                {"kind": "final", "id": "no", "done_data": "'default'"}
            ]
        });

        let initial = Obj::new();
        initial.add("mode", "override").unwrap();
        let interp = session(doc);
        let sender = interp.sender();
        let handle = tokio::spawn(interp.run(Value::from(initial)));

        sender.send(Event::external("go")).unwrap();
        assert_eq!(finished(handle).await.unwrap(), Value::from("override"));
    }

    #[tokio::test]
    async fn session_id_option_is_visible_in_expressions() {
        let interp = session(json!({
            "states": [{"kind": "final", "id": "end", "done_data": "_sessionid"}]
        }))
        .with_options(InterpreterOptions {
            session_id: Some("s-42".to_string()),
            ..InterpreterOptions::default()
        });
        let handle = tokio::spawn(interp.run(Value::Undefined));
        assert_eq!(finished(handle).await.unwrap(), Value::from("s-42"));
    }

    #[tokio::test]
    async fn explicit_initial_and_eventless_chain() {
        // The explicit initial child has an eventless transition straight
        // to a final state; the run completes without any external event.
        let interp = session(json!({
            "datamodel": [{"id": "ready", "expr": "true"}],
            "states": [
                {"kind": "state", "id": "outer", "initial": ["inner2"], "states": [
                    {"kind": "state", "id": "inner1"},
                    {"kind": "state", "id": "inner2",
                     "transitions": [{"cond": "ready", "targets": ["end"]}]}
                ]},
                {"kind": "final", "id": "end", "done_data": "'done'"}
            ]
        }));
        let handle = tokio::spawn(interp.run(Value::Undefined));
        assert_eq!(finished(handle).await.unwrap(), Value::from("done"));
    }

    #[tokio::test]
    async fn internal_events_processed_before_external() {
        let interp = session(json!({
            "states": [
                {"kind": "state", "id": "s",
                 "on_entry": [
                     {"action": "send", "event": "outer"},
                     {"action": "raise", "event": "inner"}
                 ],
                 "transitions": [
                     {"events": ["inner"], "targets": ["fi"]},
                     {"events": ["outer"], "targets": ["fo"]}
                 ]},
                {"kind": "final", "id": "fi", "done_data": "'internal-first'"},
                {"kind": "final", "id": "fo", "done_data": "'external-first'"}
            ]
        }));
        let handle = tokio::spawn(interp.run(Value::Undefined));
        assert_eq!(
            finished(handle).await.unwrap(),
            Value::from("internal-first")
        );
    }

    #[tokio::test]
    async fn innermost_transition_wins() {
        let interp = session(json!({
            "states": [
                {"kind": "state", "id": "outer",
                 "transitions": [{"events": ["e"], "targets": ["anc"]}],
                 "states": [
                     {"kind": "state", "id": "child",
                      "transitions": [{"events": ["e"], "targets": ["desc"]}]}
                 ]},
                {"kind": "final", "id": "desc", "done_data": "'descendant'"},
                {"kind": "final", "id": "anc", "done_data": "'ancestor'"}
            ]
        }));
        let sender = interp.sender();
        let handle = tokio::spawn(interp.run(Value::Undefined));

        sender.send(Event::external("e")).unwrap();
        assert_eq!(finished(handle).await.unwrap(), Value::from("descendant"));
    }

    #[tokio::test]
    async fn parallel_completes_when_all_regions_final() {
        let interp = session(json!({
            "states": [
                {"kind": "parallel", "id": "p",
                 "transitions": [{"events": ["done.state.p"], "targets": ["end"]}],
                 "states": [
                     {"kind": "state", "id": "r1", "states": [
                         {"kind": "state", "id": "r1a",
                          "transitions": [{"events": ["a"], "targets": ["r1f"]}]},
                         {"kind": "final", "id": "r1f"}
                     ]},
                     {"kind": "state", "id": "r2", "states": [
                         {"kind": "state", "id": "r2a",
                          "transitions": [{"events": ["b"], "targets": ["r2f"]}]},
                         {"kind": "final", "id": "r2f"}
                     ]}
                 ]},
                {"kind": "final", "id": "end", "done_data": "'both'"}
            ]
        }));
        let sender = interp.sender();
        let handle = tokio::spawn(interp.run(Value::Undefined));

        // One region finishing must not complete the parallel state.
        sender.send(Event::external("a")).unwrap();
        settle().await;
        assert!(!handle.is_finished());

        sender.send(Event::external("b")).unwrap();
        assert_eq!(finished(handle).await.unwrap(), Value::from("both"));
    }

    #[tokio::test]
    async fn done_state_carries_final_done_data() {
        let interp = session(json!({
            "datamodel": [{"id": "result"}],
            "states": [
                {"kind": "state", "id": "c", "initial": ["go"],
                 "transitions": [
                     {"events": ["done.state.c"], "targets": ["end"],
                      "actions": [{"action": "assign", "location": "result",
                                   "expr": "_event.data"}]}
                 ],
                 "states": [
                     {"kind": "final", "id": "cf", "done_data": "'region-result'"},
                     {"kind": "state", "id": "go",
                      "transitions": [{"events": ["fin"], "targets": ["cf"]}]}
                 ]},
                {"kind": "final", "id": "end", "done_data": "result"}
            ]
        }));
        let sender = interp.sender();
        let handle = tokio::spawn(interp.run(Value::Undefined));

        sender.send(Event::external("fin")).unwrap();
        assert_eq!(
            finished(handle).await.unwrap(),
            Value::from("region-result")
        );
    }

    #[tokio::test]
    async fn shallow_history_restores_last_child() {
        let interp = session(json!({
            "states": [
                {"kind": "state", "id": "work", "initial": ["w1"],
                 "transitions": [{"events": ["pause"], "targets": ["paused"]}],
                 "states": [
                     {"kind": "history", "id": "hist", "targets": ["w1"]},
                     {"kind": "state", "id": "w1",
                      "transitions": [{"events": ["next"], "targets": ["w2"]}]},
                     {"kind": "state", "id": "w2",
                      "transitions": [{"events": ["finish"], "targets": ["end"]}]}
                 ]},
                {"kind": "state", "id": "paused",
                 "transitions": [{"events": ["resume"], "targets": ["hist"]}]},
                {"kind": "final", "id": "end", "done_data": "'finished-from-w2'"}
            ]
        }));
        let sender = interp.sender();
        let handle = tokio::spawn(interp.run(Value::Undefined));

        for event in ["next", "pause", "resume", "finish"] {
            sender.send(Event::external(event)).unwrap();
        }
        // "finish" only fires from w2, so completion proves the history
        // re-entered w2 rather than the default w1.
        assert_eq!(
            finished(handle).await.unwrap(),
            Value::from("finished-from-w2")
        );
    }

    #[tokio::test]
    async fn echo_invoke_payload_reaches_finalize_and_done_data() {
        let interp = session(json!({
            "datamodel": [{"id": "reply"}],
            "states": [
                {"kind": "state", "id": "calling",
                 "invokes": [{"type": "echo", "id": "svc", "content": "'ping'",
                              "finalize": [{"action": "assign", "location": "reply",
                                            "expr": "_event.data"}]}],
                 "transitions": [{"events": ["done.invoke"], "targets": ["end"]}]},
                {"kind": "final", "id": "end", "done_data": "reply"}
            ]
        }));
        let handle = tokio::spawn(interp.run(Value::Undefined));
        assert_eq!(finished(handle).await.unwrap(), Value::from("ping"));
    }

    #[tokio::test]
    async fn failing_guard_disables_only_that_transition() {
        let interp = session(json!({
            "datamodel": [{"id": "name", "expr": "'zed'"}],
            "states": [
                {"kind": "state", "id": "s", "transitions": [
                    {"events": ["e"], "cond": "name > 5", "targets": ["bad"]},
                    {"events": ["e"], "targets": ["good"]}
                ]},
                {"kind": "final", "id": "bad", "done_data": "'bad'"},
                {"kind": "final", "id": "good", "done_data": "'good'"}
            ]
        }));
        let sender = interp.sender();
        let handle = tokio::spawn(interp.run(Value::Undefined));

        sender.send(Event::external("e")).unwrap();
        assert_eq!(finished(handle).await.unwrap(), Value::from("good"));
    }

    #[tokio::test]
    async fn targetless_transition_runs_actions_without_exit() {
        let interp = session(json!({
            "datamodel": [{"id": "flag", "expr": "false"}],
            "states": [
                {"kind": "state", "id": "s", "transitions": [
                    {"events": ["mark"],
                     "actions": [{"action": "assign", "location": "flag", "expr": "true"}]},
                    {"events": ["check"], "cond": "flag", "targets": ["end"]}
                ]},
                {"kind": "final", "id": "end", "done_data": "'marked'"}
            ]
        }));
        let sender = interp.sender();
        let handle = tokio::spawn(interp.run(Value::Undefined));

        sender.send(Event::external("mark")).unwrap();
        sender.send(Event::external("check")).unwrap();
        assert_eq!(finished(handle).await.unwrap(), Value::from("marked"));
    }

    #[tokio::test]
    async fn unhandled_error_event_halts_when_configured() {
        let interp = session(json!({
            "states": [
                {"kind": "state", "id": "a",
                 "on_entry": [{"action": "assign", "location": "missing.field", "expr": "1"}]}
            ]
        }))
        .with_options(InterpreterOptions {
            unhandled_error: UnhandledErrorBehaviour::HaltStateMachine,
            ..InterpreterOptions::default()
        });
        let handle = tokio::spawn(interp.run(Value::Undefined));
        assert!(matches!(
            finished(handle).await,
            Err(RunError::UnhandledError { event }) if event == "error.execution"
        ));
    }

    #[tokio::test]
    async fn unhandled_error_event_ignored_by_default() {
        let interp = session(json!({
            "states": [
                {"kind": "state", "id": "a",
                 "on_entry": [{"action": "assign", "location": "missing.field", "expr": "1"}],
                 "transitions": [{"events": ["go"], "targets": ["end"]}]},
                {"kind": "final", "id": "end", "done_data": "'survived'"}
            ]
        }));
        let sender = interp.sender();
        let handle = tokio::spawn(interp.run(Value::Undefined));

        sender.send(Event::external("go")).unwrap();
        assert_eq!(finished(handle).await.unwrap(), Value::from("survived"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let interp = session(json!({
            "states": [{"kind": "state", "id": "forever"}]
        }));
        let cancel = interp.cancel_handle();
        let handle = tokio::spawn(interp.run(Value::Undefined));

        settle().await;
        cancel.cancel();
        assert!(matches!(finished(handle).await, Err(RunError::Cancelled)));
    }

    #[tokio::test]
    async fn eventless_livelock_is_detected() {
        let interp = session(json!({
            "states": [
                {"kind": "state", "id": "ping",
                 "transitions": [{"targets": ["pong"]}]},
                {"kind": "state", "id": "pong",
                 "transitions": [{"targets": ["ping"]}]}
            ]
        }))
        .with_options(InterpreterOptions {
            max_microsteps: 16,
            ..InterpreterOptions::default()
        });
        let handle = tokio::spawn(interp.run(Value::Undefined));
        assert!(matches!(finished(handle).await, Err(RunError::Platform(_))));
    }

    fn checkpoint_doc() -> serde_json::Value {
        json!({
            "datamodel": [{"id": "step", "expr": "'none'"}],
            "states": [
                {"kind": "state", "id": "a",
                 "transitions": [{"events": ["advance"], "targets": ["b"],
                     "actions": [{"action": "assign", "location": "step",
                                  "expr": "'a-to-b'"}]}]},
                {"kind": "state", "id": "b",
                 "transitions": [{"events": ["finish"], "targets": ["end"]}]},
                {"kind": "final", "id": "end", "done_data": "step"}
            ]
        })
    }

    #[tokio::test]
    async fn restore_resumes_with_configuration_and_data() {
        let log: Arc<dyn CheckpointLog> = Arc::new(MemoryLog::new());
        let compiled = compile(checkpoint_doc());

        let interp = Interpreter::new(compiled.clone(), Arc::new(ServiceRegistry::new()))
            .with_checkpoint(log.clone());
        let sender = interp.sender();
        let cancel = interp.cancel_handle();
        let handle = tokio::spawn(interp.run(Value::Undefined));

        sender.send(Event::external("advance")).unwrap();
        settle().await;
        cancel.cancel();
        assert!(matches!(finished(handle).await, Err(RunError::Cancelled)));

        let restored =
            Interpreter::restore(compiled.clone(), Arc::new(ServiceRegistry::new()), log)
                .unwrap();
        let b = compiled.model().state_by_id("b").unwrap();
        assert!(restored.configuration().contains(&b));

        let sender = restored.sender();
        let handle = tokio::spawn(restored.resume());
        sender.send(Event::external("finish")).unwrap();
        // The assignment made before the crash survives the checkpoint.
        assert_eq!(finished(handle).await.unwrap(), Value::from("a-to-b"));
    }

    #[tokio::test]
    async fn restore_from_file_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.ckpt");
        let compiled = compile(checkpoint_doc());

        {
            let log: Arc<dyn CheckpointLog> =
                Arc::new(FileLog::open(LogConfig::new(&path)).unwrap());
            let interp = Interpreter::new(compiled.clone(), Arc::new(ServiceRegistry::new()))
                .with_checkpoint(log);
            let sender = interp.sender();
            let cancel = interp.cancel_handle();
            let handle = tokio::spawn(interp.run(Value::Undefined));

            sender.send(Event::external("advance")).unwrap();
            settle().await;
            cancel.cancel();
            assert!(matches!(finished(handle).await, Err(RunError::Cancelled)));
        }

        let log: Arc<dyn CheckpointLog> =
            Arc::new(FileLog::open(LogConfig::new(&path)).unwrap());
        let restored =
            Interpreter::restore(compiled, Arc::new(ServiceRegistry::new()), log).unwrap();
        let sender = restored.sender();
        let handle = tokio::spawn(restored.resume());

        sender.send(Event::external("finish")).unwrap();
        assert_eq!(finished(handle).await.unwrap(), Value::from("a-to-b"));
    }

    #[tokio::test]
    async fn restore_fails_on_empty_log() {
        let log: Arc<dyn CheckpointLog> = Arc::new(MemoryLog::new());
        let result = Interpreter::restore(
            compile(checkpoint_doc()),
            Arc::new(ServiceRegistry::new()),
            log,
        );
        assert!(matches!(result, Err(RunError::Platform(_))));
    }
}
