//! The per-session data model.
//!
//! A thin wrapper over the root [`Obj`]: dotted-path reads and writes for
//! location evaluators, plus the system variables (`_event`, `_name`,
//! `_sessionid`) the interpreter maintains. System variables are protected
//! from assignment by their leading underscore; the interpreter itself
//! writes them through [`DataModel::set_system`].

use crate::error::ExecutionError;
use stateflow_value::{Obj, Value};

/// The data-model value tree of one session.
#[derive(Debug, Clone, Default)]
pub struct DataModel {
    root: Obj,
}

impl DataModel {
    pub fn new() -> Self {
        Self { root: Obj::new() }
    }

    /// Wraps an existing root, e.g. one decoded from a checkpoint.
    pub fn from_root(root: Obj) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Obj {
        &self.root
    }

    /// Reads a dotted location. Missing segments resolve to `Undefined`;
    /// numeric segments index positional entries.
    pub fn get(&self, location: &str) -> Value {
        let mut current = Value::Object(self.root.clone());
        for segment in location.split('.') {
            let Value::Object(obj) = current.resolve() else {
                return Value::Undefined;
            };
            current = match segment.parse::<usize>() {
                Ok(idx) => obj.index(idx),
                Err(_) => obj.get(segment),
            };
        }
        current
    }

    /// Writes a dotted location. Every intermediate segment must already
    /// resolve to an object; the final segment is created when absent.
    pub fn set(&self, location: &str, value: Value) -> Result<(), ExecutionError> {
        if location.starts_with('_') {
            return Err(ExecutionError::IllegalLocation {
                location: location.to_string(),
                reason: "system variables are protected".to_string(),
            });
        }
        let (parent, key) = self.resolve_parent(location)?;
        parent.set(key, value)?;
        Ok(())
    }

    /// Removes a dotted location if present.
    pub fn remove(&self, location: &str) -> Result<(), ExecutionError> {
        let (parent, key) = self.resolve_parent(location)?;
        parent.remove(key)?;
        Ok(())
    }

    /// Declares a top-level variable, overwriting any existing value.
    pub fn declare(&self, id: &str, value: Value) -> Result<(), ExecutionError> {
        self.root.set(id, value)?;
        Ok(())
    }

    /// Writes a system variable (`_event`, `_name`, `_sessionid`).
    pub fn set_system(&self, name: &str, value: Value) {
        // The root object is writable for the interpreter's own writes.
        let _ = self.root.set(name, value);
    }

    fn resolve_parent<'a>(&self, location: &'a str) -> Result<(Obj, &'a str), ExecutionError> {
        let mut segments = location.split('.');
        let last = location.rsplit('.').next().unwrap_or(location);
        let mut current = self.root.clone();

        let parent_count = location.matches('.').count();
        for _ in 0..parent_count {
            let segment = segments.next().unwrap_or_default();
            let next = match segment.parse::<usize>() {
                Ok(idx) => current.index(idx),
                Err(_) => current.get(segment),
            };
            match next.resolve() {
                Value::Object(obj) => current = obj,
                _ => {
                    return Err(ExecutionError::IllegalLocation {
                        location: location.to_string(),
                        reason: format!("'{segment}' is not an object"),
                    });
                }
            }
        }
        Ok((current, last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_set_nested() {
        let dm = DataModel::new();
        let inner = Obj::new();
        inner.add("count", 1i32).unwrap();
        dm.declare("order", Value::from(inner)).unwrap();

        assert_eq!(dm.get("order.count"), Value::from(1i32));

        dm.set("order.count", Value::from(2i32)).unwrap();
        assert_eq!(dm.get("order.count"), Value::from(2i32));
    }

    #[test]
    fn missing_path_is_undefined() {
        let dm = DataModel::new();
        assert_eq!(dm.get("nothing.here"), Value::Undefined);
    }

    #[test]
    fn set_through_missing_intermediate_fails() {
        let dm = DataModel::new();
        let result = dm.set("missing.field", Value::Null);
        assert!(matches!(
            result,
            Err(ExecutionError::IllegalLocation { .. })
        ));
    }

    #[test]
    fn system_variables_are_protected() {
        let dm = DataModel::new();
        dm.set_system("_sessionid", Value::from("s-1"));

        assert_eq!(dm.get("_sessionid"), Value::from("s-1"));
        assert!(matches!(
            dm.set("_sessionid", Value::from("other")),
            Err(ExecutionError::IllegalLocation { .. })
        ));
    }

    #[test]
    fn positional_index_access() {
        let dm = DataModel::new();
        let items = Obj::new();
        items.push("a").unwrap();
        items.push("b").unwrap();
        dm.declare("items", Value::from(items)).unwrap();

        assert_eq!(dm.get("items.1"), Value::from("b"));
        assert_eq!(dm.get("items.5"), Value::Undefined);
    }
}
