//! Ordered object storage.
//!
//! An [`Obj`] is an ordered list of entries, each holding an optional string
//! key (absent means "array slot"), a value, a per-entry access level, and
//! optional metadata. Key lookup is case-sensitive or case-insensitive,
//! fixed at creation. Obj handles are cheap to copy; all copies share the
//! same underlying storage.

use crate::error::ValueError;
use crate::value::Value;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Write permission for an object or a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessLevel {
    #[default]
    Writable,
    ReadOnly,
    Constant,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Writable => "writable",
            AccessLevel::ReadOnly => "read-only",
            AccessLevel::Constant => "constant",
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, AccessLevel::Writable)
    }
}

/// One slot in an object.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Absent for array slots.
    pub key: Option<Arc<str>>,
    pub value: Value,
    pub access: AccessLevel,
    pub metadata: Option<Obj>,
}

impl Entry {
    pub fn new(key: impl Into<Arc<str>>, value: Value) -> Self {
        Self {
            key: Some(key.into()),
            value,
            access: AccessLevel::Writable,
            metadata: None,
        }
    }

    pub fn positional(value: Value) -> Self {
        Self {
            key: None,
            value,
            access: AccessLevel::Writable,
            metadata: None,
        }
    }

    pub fn with_access(mut self, access: AccessLevel) -> Self {
        self.access = access;
        self
    }

    pub fn with_metadata(mut self, metadata: Obj) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug)]
struct ObjInner {
    case_insensitive: bool,
    access: AccessLevel,
    entries: RwLock<Vec<Entry>>,
}

/// Shared handle to ordered object storage.
#[derive(Clone)]
pub struct Obj {
    inner: Arc<ObjInner>,
}

impl Obj {
    /// Creates an empty, writable, case-sensitive object.
    pub fn new() -> Self {
        Self::make(false, AccessLevel::Writable)
    }

    /// Creates an empty, writable object with case-insensitive key lookup.
    pub fn case_insensitive() -> Self {
        Self::make(true, AccessLevel::Writable)
    }

    fn make(case_insensitive: bool, access: AccessLevel) -> Self {
        Self {
            inner: Arc::new(ObjInner {
                case_insensitive,
                access,
                entries: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.inner.case_insensitive
    }

    pub fn access(&self) -> AccessLevel {
        self.inner.access
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    fn key_matches(&self, entry_key: &str, lookup: &str) -> bool {
        if self.inner.case_insensitive {
            entry_key.eq_ignore_ascii_case(lookup)
        } else {
            entry_key == lookup
        }
    }

    /// Returns the value for `key`, or `Undefined` when absent.
    pub fn get(&self, key: &str) -> Value {
        self.get_entry(key).map(|e| e.value).unwrap_or_default()
    }

    /// Returns the first entry matching `key`.
    pub fn get_entry(&self, key: &str) -> Option<Entry> {
        self.inner
            .entries
            .read()
            .iter()
            .find(|e| e.key.as_deref().is_some_and(|k| self.key_matches(k, key)))
            .cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get_entry(key).is_some()
    }

    /// Returns the value at a positional index, or `Undefined`.
    pub fn index(&self, idx: usize) -> Value {
        self.inner
            .entries
            .read()
            .get(idx)
            .map(|e| e.value.clone())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<Option<Arc<str>>> {
        self.inner
            .entries
            .read()
            .iter()
            .map(|e| e.key.clone())
            .collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.inner
            .entries
            .read()
            .iter()
            .map(|e| e.value.clone())
            .collect()
    }

    /// Snapshot of all entries in order.
    pub fn entries(&self) -> Vec<Entry> {
        self.inner.entries.read().clone()
    }

    fn check_writable(&self, target: &str) -> Result<(), ValueError> {
        if self.inner.access.is_writable() {
            Ok(())
        } else {
            Err(ValueError::AccessViolation {
                target: target.to_string(),
                access: self.inner.access.as_str(),
            })
        }
    }

    /// Appends a keyed entry. Duplicate keys are allowed; `set` and `get`
    /// operate on the first match.
    pub fn add(&self, key: impl Into<Arc<str>>, value: impl Into<Value>) -> Result<(), ValueError> {
        self.add_entry(Entry::new(key, value.into()))
    }

    /// Appends an array slot.
    pub fn push(&self, value: impl Into<Value>) -> Result<(), ValueError> {
        self.add_entry(Entry::positional(value.into()))
    }

    pub fn add_entry(&self, entry: Entry) -> Result<(), ValueError> {
        self.check_writable(entry.key.as_deref().unwrap_or("<slot>"))?;
        self.inner.entries.write().push(entry);
        Ok(())
    }

    /// Replaces the value of the first entry matching `key`, or appends a
    /// new entry when no match exists.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), ValueError> {
        self.check_writable(key)?;
        let mut entries = self.inner.entries.write();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.key.as_deref().is_some_and(|k| self.key_matches(k, key)))
        {
            if !entry.access.is_writable() {
                return Err(ValueError::AccessViolation {
                    target: key.to_string(),
                    access: entry.access.as_str(),
                });
            }
            entry.value = value.into();
            return Ok(());
        }
        entries.push(Entry::new(key, value.into()));
        Ok(())
    }

    /// Removes the first entry matching `key`. Returns whether an entry was
    /// removed.
    pub fn remove(&self, key: &str) -> Result<bool, ValueError> {
        self.check_writable(key)?;
        let mut entries = self.inner.entries.write();
        let pos = entries
            .iter()
            .position(|e| e.key.as_deref().is_some_and(|k| self.key_matches(k, key)));
        match pos {
            Some(idx) => {
                if !entries[idx].access.is_writable() {
                    return Err(ValueError::AccessViolation {
                        target: key.to_string(),
                        access: entries[idx].access.as_str(),
                    });
                }
                entries.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deep clone producing a writable object tree.
    pub fn clone_writable(&self) -> Obj {
        self.deep_clone(AccessLevel::Writable, false, &mut HashMap::new())
    }

    /// Deep clone whose root and nested objects reject mutation.
    pub fn clone_readonly(&self) -> Obj {
        self.deep_clone(AccessLevel::ReadOnly, false, &mut HashMap::new())
    }

    /// Deep clone where objects and every entry are constant.
    pub fn as_constant(&self) -> Obj {
        self.deep_clone(AccessLevel::Constant, true, &mut HashMap::new())
    }

    /// Deep clone with an identity map so shared and cyclic substructure
    /// is preserved and the pass terminates.
    fn deep_clone(
        &self,
        access: AccessLevel,
        freeze_entries: bool,
        seen: &mut HashMap<usize, Obj>,
    ) -> Obj {
        let identity = Arc::as_ptr(&self.inner) as usize;
        if let Some(existing) = seen.get(&identity) {
            return existing.clone();
        }

        let clone = Self::make(self.inner.case_insensitive, access);
        seen.insert(identity, clone.clone());

        let snapshot = self.inner.entries.read().clone();
        let mut cloned = Vec::with_capacity(snapshot.len());
        for entry in snapshot {
            cloned.push(Entry {
                key: entry.key.clone(),
                value: clone_value(&entry.value, access, freeze_entries, seen),
                access: if freeze_entries {
                    AccessLevel::Constant
                } else {
                    entry.access
                },
                metadata: entry
                    .metadata
                    .as_ref()
                    .map(|m| m.deep_clone(access, freeze_entries, seen)),
            });
        }
        *clone.inner.entries.write() = cloned;
        clone
    }

    /// Identity comparison: both handles share the same storage.
    pub fn ptr_eq(&self, other: &Obj) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable identity of the underlying storage, usable as a map key for
    /// clone/visit bookkeeping.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn deep_eq(&self, other: &Obj, visited: &mut HashSet<(usize, usize)>) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let pair = (
            Arc::as_ptr(&self.inner) as usize,
            Arc::as_ptr(&other.inner) as usize,
        );
        // A revisited pair means we are inside a cycle that has matched so
        // far; treat it as equal to terminate.
        if !visited.insert(pair) {
            return true;
        }
        if self.inner.case_insensitive != other.inner.case_insensitive {
            return false;
        }
        let a = self.inner.entries.read().clone();
        let b = other.inner.entries.read().clone();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b.iter()).all(|(ea, eb)| {
            ea.key == eb.key && value_eq(&ea.value, &eb.value, visited)
        })
    }
}

fn clone_value(
    value: &Value,
    access: AccessLevel,
    freeze_entries: bool,
    seen: &mut HashMap<usize, Obj>,
) -> Value {
    match value.resolve() {
        Value::Object(o) => Value::Object(o.deep_clone(access, freeze_entries, seen)),
        other => other,
    }
}

fn value_eq(a: &Value, b: &Value, visited: &mut HashSet<(usize, usize)>) -> bool {
    match (a.resolve(), b.resolve()) {
        (Value::Object(oa), Value::Object(ob)) => oa.deep_eq(&ob, visited),
        (ra, rb) => ra == rb,
    }
}

impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        self.deep_eq(other, &mut HashSet::new())
    }
}

impl Default for Obj {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Obj({} entries, {})",
            self.len(),
            self.inner.access.as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_set() {
        let obj = Obj::new();
        obj.add("a", 1i32).unwrap();
        obj.add("b", "two").unwrap();
        assert_eq!(obj.get("a"), Value::from(1i32));
        assert_eq!(obj.get("missing"), Value::Undefined);

        obj.set("a", 10i32).unwrap();
        assert_eq!(obj.get("a"), Value::from(10i32));
        assert_eq!(obj.len(), 2);

        // Set on an absent key appends.
        obj.set("c", true).unwrap();
        assert_eq!(obj.len(), 3);
    }

    #[test]
    fn readonly_clone_rejects_set_but_original_stays_writable() {
        let obj = Obj::new();
        obj.add("a", 1i32).unwrap();

        let frozen = obj.clone_readonly();
        let err = frozen.set("a", 2i32).unwrap_err();
        assert!(matches!(err, ValueError::AccessViolation { .. }));

        obj.set("a", 2i32).unwrap();
        assert_eq!(obj.get("a"), Value::from(2i32));
        assert_eq!(frozen.get("a"), Value::from(1i32));
    }

    #[test]
    fn constant_clone_freezes_entries() {
        let obj = Obj::new();
        obj.add("a", 1i32).unwrap();
        let constant = obj.as_constant();
        assert_eq!(constant.access(), AccessLevel::Constant);
        assert_eq!(
            constant.get_entry("a").unwrap().access,
            AccessLevel::Constant
        );
    }

    #[test]
    fn readonly_entry_rejects_set_on_writable_object() {
        let obj = Obj::new();
        obj.add_entry(Entry::new("pinned", Value::from(1i32)).with_access(AccessLevel::ReadOnly))
            .unwrap();
        obj.add("free", 2i32).unwrap();

        assert!(obj.set("free", 3i32).is_ok());
        assert!(matches!(
            obj.set("pinned", 3i32),
            Err(ValueError::AccessViolation { .. })
        ));
    }

    #[test]
    fn case_insensitive_lookup() {
        let obj = Obj::case_insensitive();
        obj.add("Alpha", 1i32).unwrap();
        assert_eq!(obj.get("alpha"), Value::from(1i32));
        assert_eq!(obj.get("ALPHA"), Value::from(1i32));

        let sensitive = Obj::new();
        sensitive.add("Alpha", 1i32).unwrap();
        assert_eq!(sensitive.get("alpha"), Value::Undefined);

        // Case-sensitivity survives cloning.
        assert!(obj.clone_writable().is_case_insensitive());
    }

    #[test]
    fn clone_preserves_shared_substructure() {
        let shared = Obj::new();
        shared.add("x", 1i32).unwrap();

        let root = Obj::new();
        root.add("first", shared.clone()).unwrap();
        root.add("second", shared).unwrap();

        let cloned = root.clone_writable();
        let first = cloned.get("first").as_object().unwrap();
        let second = cloned.get("second").as_object().unwrap();
        assert!(first.ptr_eq(&second));

        // But not shared with the original.
        let original_first = root.get("first").as_object().unwrap();
        assert!(!first.ptr_eq(&original_first));
    }

    #[test]
    fn clone_terminates_on_cycles() {
        let a = Obj::new();
        let b = Obj::new();
        a.add("b", b.clone()).unwrap();
        b.add("a", a.clone()).unwrap();

        let cloned = a.clone_writable();
        let cloned_b = cloned.get("b").as_object().unwrap();
        let back = cloned_b.get("a").as_object().unwrap();
        assert!(back.ptr_eq(&cloned));
    }

    #[test]
    fn positional_slots() {
        let list = Obj::new();
        list.push(1i32).unwrap();
        list.push(2i32).unwrap();
        assert_eq!(list.index(0), Value::from(1i32));
        assert_eq!(list.index(1), Value::from(2i32));
        assert_eq!(list.index(5), Value::Undefined);
        assert_eq!(Value::Object(list).as_list().unwrap().len(), 2);
    }

    #[test]
    fn deep_equality() {
        let a = Obj::new();
        a.add("k", 1i32).unwrap();
        let b = Obj::new();
        b.add("k", 1i32).unwrap();
        assert_eq!(a, b);

        b.set("k", 2i32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn remove_entry() {
        let obj = Obj::new();
        obj.add("a", 1i32).unwrap();
        assert!(obj.remove("a").unwrap());
        assert!(!obj.remove("a").unwrap());
        assert_eq!(obj.get("a"), Value::Undefined);
    }
}
