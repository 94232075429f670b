//! Build-time evaluator resolution.
//!
//! [`build_model`] compiles the structural model, then walks every node
//! resolving each expression surface (guards, action payloads, data
//! initializers, done-data, invoke params) through the supplied
//! [`DataModelBinding`] exactly once. Resolution failures are model-build
//! errors; nothing is compiled lazily at run time.

use crate::action::{CompiledAction, IfBranch, SendTarget};
use crate::binding::{CompileError, ConditionEvaluator, DataModelBinding, ValueEvaluator};
use stateflow_model::{
    build, ActionDocument, DocumentId, Expression, Model, ModelError, Node, StateMachineDocument,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// An invoke declaration with resolved expression surfaces.
pub struct CompiledInvoke {
    pub src: Option<Arc<dyn ValueEvaluator>>,
    pub content: Option<Arc<dyn ValueEvaluator>>,
    pub params: Vec<(String, Arc<dyn ValueEvaluator>)>,
    pub finalize: Vec<CompiledAction>,
}

/// The immutable model plus every resolved evaluator, ready to run.
pub struct CompiledModel {
    model: Model,
    conditions: HashMap<DocumentId, Arc<dyn ConditionEvaluator>>,
    transition_actions: HashMap<DocumentId, Vec<CompiledAction>>,
    entry_actions: HashMap<DocumentId, Vec<CompiledAction>>,
    exit_actions: HashMap<DocumentId, Vec<CompiledAction>>,
    data_exprs: HashMap<DocumentId, Arc<dyn ValueEvaluator>>,
    done_data: HashMap<DocumentId, Arc<dyn ValueEvaluator>>,
    invokes: HashMap<DocumentId, CompiledInvoke>,
}

impl CompiledModel {
    pub fn model(&self) -> &Model {
        &self.model
    }

    pub(crate) fn condition_of(&self, transition: DocumentId) -> Option<&dyn ConditionEvaluator> {
        self.conditions.get(&transition).map(|c| c.as_ref())
    }

    pub(crate) fn transition_actions(&self, transition: DocumentId) -> &[CompiledAction] {
        self.transition_actions
            .get(&transition)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn entry_actions(&self, state: DocumentId) -> &[CompiledAction] {
        self.entry_actions
            .get(&state)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn exit_actions(&self, state: DocumentId) -> &[CompiledAction] {
        self.exit_actions
            .get(&state)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn data_expr(&self, data: DocumentId) -> Option<&dyn ValueEvaluator> {
        self.data_exprs.get(&data).map(|e| e.as_ref())
    }

    pub(crate) fn done_data_of(&self, final_state: DocumentId) -> Option<&dyn ValueEvaluator> {
        self.done_data.get(&final_state).map(|e| e.as_ref())
    }

    pub(crate) fn invoke_of(&self, invoke: DocumentId) -> Option<&CompiledInvoke> {
        self.invokes.get(&invoke)
    }
}

/// Compiles a document and resolves every evaluator.
pub fn build_model(
    document: &StateMachineDocument,
    binding: &dyn DataModelBinding,
) -> Result<CompiledModel, ModelError> {
    let model = build(document)?;
    let mut compiler = EvaluatorPass {
        binding,
        conditions: HashMap::new(),
        transition_actions: HashMap::new(),
        entry_actions: HashMap::new(),
        exit_actions: HashMap::new(),
        data_exprs: HashMap::new(),
        done_data: HashMap::new(),
        invokes: HashMap::new(),
    };
    compiler.resolve(&model)?;

    tracing::debug!(
        conditions = compiler.conditions.len(),
        actions = compiler.transition_actions.len()
            + compiler.entry_actions.len()
            + compiler.exit_actions.len(),
        "evaluators resolved"
    );

    Ok(CompiledModel {
        model,
        conditions: compiler.conditions,
        transition_actions: compiler.transition_actions,
        entry_actions: compiler.entry_actions,
        exit_actions: compiler.exit_actions,
        data_exprs: compiler.data_exprs,
        done_data: compiler.done_data,
        invokes: compiler.invokes,
    })
}

struct EvaluatorPass<'a> {
    binding: &'a dyn DataModelBinding,
    conditions: HashMap<DocumentId, Arc<dyn ConditionEvaluator>>,
    transition_actions: HashMap<DocumentId, Vec<CompiledAction>>,
    entry_actions: HashMap<DocumentId, Vec<CompiledAction>>,
    exit_actions: HashMap<DocumentId, Vec<CompiledAction>>,
    data_exprs: HashMap<DocumentId, Arc<dyn ValueEvaluator>>,
    done_data: HashMap<DocumentId, Arc<dyn ValueEvaluator>>,
    invokes: HashMap<DocumentId, CompiledInvoke>,
}

impl EvaluatorPass<'_> {
    fn resolve(&mut self, model: &Model) -> Result<(), ModelError> {
        for node in model.nodes() {
            match node {
                Node::Transition(t) => {
                    if let Some(cond) = &t.cond {
                        let compiled = self
                            .binding
                            .compile_condition(cond.as_str())
                            .map_err(|e| resolution_error("condition", e))?;
                        self.conditions.insert(t.id, compiled);
                    }
                    let actions = self.compile_actions(&t.actions)?;
                    if !actions.is_empty() {
                        self.transition_actions.insert(t.id, actions);
                    }
                }
                Node::Data(d) => {
                    if let Some(expr) = &d.expr {
                        let compiled = self.compile_expression(expr)?;
                        self.data_exprs.insert(d.id, compiled);
                    }
                }
                Node::Invoke(i) => {
                    let compiled = CompiledInvoke {
                        src: self.compile_optional(&i.src)?,
                        content: self.compile_optional(&i.content)?,
                        params: i
                            .params
                            .iter()
                            .map(|p| Ok((p.name.clone(), self.compile_expression(&p.expr)?)))
                            .collect::<Result<_, ModelError>>()?,
                        finalize: self.compile_actions(&i.finalize)?,
                    };
                    self.invokes.insert(i.id, compiled);
                }
                Node::Final(f) => {
                    if let Some(expr) = &f.done_data {
                        let compiled = self.compile_expression(expr)?;
                        self.done_data.insert(f.id, compiled);
                    }
                    self.compile_entry_exit(f.id, &f.on_entry, &f.on_exit)?;
                }
                Node::State(s) => {
                    self.compile_entry_exit(s.id, &s.on_entry, &s.on_exit)?;
                }
                Node::Parallel(p) => {
                    self.compile_entry_exit(p.id, &p.on_entry, &p.on_exit)?;
                }
                Node::StateMachine(_) | Node::History(_) => {}
            }
        }
        Ok(())
    }

    fn compile_entry_exit(
        &mut self,
        id: DocumentId,
        on_entry: &[ActionDocument],
        on_exit: &[ActionDocument],
    ) -> Result<(), ModelError> {
        let entry = self.compile_actions(on_entry)?;
        if !entry.is_empty() {
            self.entry_actions.insert(id, entry);
        }
        let exit = self.compile_actions(on_exit)?;
        if !exit.is_empty() {
            self.exit_actions.insert(id, exit);
        }
        Ok(())
    }

    fn compile_optional(
        &self,
        expr: &Option<Expression>,
    ) -> Result<Option<Arc<dyn ValueEvaluator>>, ModelError> {
        expr.as_ref().map(|e| self.compile_expression(e)).transpose()
    }

    fn compile_expression(
        &self,
        expr: &Expression,
    ) -> Result<Arc<dyn ValueEvaluator>, ModelError> {
        self.binding
            .compile_expression(expr.as_str())
            .map_err(|e| resolution_error("expression", e))
    }

    fn compile_actions(
        &self,
        actions: &[ActionDocument],
    ) -> Result<Vec<CompiledAction>, ModelError> {
        actions.iter().map(|a| self.compile_action(a)).collect()
    }

    fn compile_action(&self, action: &ActionDocument) -> Result<CompiledAction, ModelError> {
        Ok(match action {
            ActionDocument::Assign { location, expr } => CompiledAction::Assign {
                location: self
                    .binding
                    .compile_location(location)
                    .map_err(|e| resolution_error("location", e))?,
                expr: self.compile_expression(expr)?,
            },
            ActionDocument::Raise { event } => CompiledAction::Raise {
                event: event.clone(),
            },
            ActionDocument::Send {
                event,
                data,
                id,
                delay_ms,
                target,
            } => CompiledAction::Send {
                event: event.clone(),
                data: self.compile_optional(data)?,
                send_id: id.clone(),
                delay: delay_ms.map(Duration::from_millis),
                target: SendTarget::parse(target.as_deref()).map_err(|reason| {
                    ModelError::EvaluatorResolution {
                        kind: "send target",
                        source: target.clone().unwrap_or_default(),
                        reason,
                    }
                })?,
            },
            ActionDocument::Cancel { send_id } => CompiledAction::Cancel {
                send_id: send_id.clone(),
            },
            ActionDocument::Log { label, expr } => CompiledAction::Log {
                label: label.clone(),
                expr: self.compile_optional(expr)?,
            },
            ActionDocument::Script { source } => CompiledAction::Script {
                script: self
                    .binding
                    .compile_script(source.as_str())
                    .map_err(|e| resolution_error("script", e))?,
            },
            ActionDocument::If { branches } => CompiledAction::If {
                branches: branches
                    .iter()
                    .map(|b| {
                        Ok(IfBranch {
                            cond: b
                                .cond
                                .as_ref()
                                .map(|c| {
                                    self.binding
                                        .compile_condition(c.as_str())
                                        .map_err(|e| resolution_error("condition", e))
                                })
                                .transpose()?,
                            actions: self.compile_actions(&b.actions)?,
                        })
                    })
                    .collect::<Result<_, ModelError>>()?,
            },
            ActionDocument::ForEach {
                array,
                item,
                index,
                actions,
            } => CompiledAction::ForEach {
                array: self.compile_expression(array)?,
                item: item.clone(),
                index: index.clone(),
                actions: self.compile_actions(actions)?,
            },
        })
    }
}

fn resolution_error(kind: &'static str, error: CompileError) -> ModelError {
    ModelError::EvaluatorResolution {
        kind,
        source: error.text,
        reason: error.reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BasicBinding;
    use serde_json::json;

    fn doc(json: serde_json::Value) -> StateMachineDocument {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn resolves_every_surface_at_build_time() {
        let compiled = build_model(
            &doc(json!({
                "datamodel": [{"id": "count", "expr": "0"}],
                "states": [
                    {"kind": "state", "id": "a",
                     "on_entry": [{"action": "assign", "location": "count", "expr": "1"}],
                     "transitions": [
                         {"events": ["go"], "targets": ["b"], "cond": "count == 1"}
                     ]},
                    {"kind": "final", "id": "b", "done_data": "count"}
                ]
            })),
            &BasicBinding,
        )
        .unwrap();

        let a = compiled.model().state_by_id("a").unwrap();
        let b = compiled.model().state_by_id("b").unwrap();
        let t = compiled.model().transitions_of(a)[0];

        assert!(compiled.condition_of(t).is_some());
        assert_eq!(compiled.entry_actions(a).len(), 1);
        assert!(compiled.done_data_of(b).is_some());
        assert_eq!(compiled.data_exprs.len(), 1);
    }

    #[test]
    fn bad_condition_fails_the_build() {
        let result = build_model(
            &doc(json!({
                "states": [
                    {"kind": "state", "id": "a",
                     "transitions": [{"events": ["go"], "targets": ["a"], "cond": "((("}]}
                ]
            })),
            &BasicBinding,
        );
        assert!(matches!(
            result,
            Err(ModelError::EvaluatorResolution { kind: "condition", .. })
        ));
    }

    #[test]
    fn bad_send_target_fails_the_build() {
        let result = build_model(
            &doc(json!({
                "states": [
                    {"kind": "state", "id": "a",
                     "on_entry": [{"action": "send", "event": "e", "target": "#_scxml_other"}]}
                ]
            })),
            &BasicBinding,
        );
        assert!(matches!(
            result,
            Err(ModelError::EvaluatorResolution { kind: "send target", .. })
        ));
    }

    #[test]
    fn script_rejected_by_basic_binding() {
        let result = build_model(
            &doc(json!({
                "states": [
                    {"kind": "state", "id": "a",
                     "on_entry": [{"action": "script", "source": "launch()"}]}
                ]
            })),
            &BasicBinding,
        );
        assert!(matches!(
            result,
            Err(ModelError::EvaluatorResolution { kind: "script", .. })
        ));
    }
}
