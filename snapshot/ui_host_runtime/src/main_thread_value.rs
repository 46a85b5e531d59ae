//! Handles to state that only lives on the main side.
//!
//! Both sides mint ids before the channel is established: background ids are
//! positive, main ids are negative, so the two spaces never collide. A handle
//! always crosses the channel as `{__MT_PERSIST__: true, id, initValue, type}`
//! and is rebuilt on the main side through a type registry.

use crate::error::ThreadAccessError;
use crate::patch::InitValuePatch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

pub const MT_PERSIST_KEY: &str = "__MT_PERSIST__";
pub const MAIN_THREAD_REF_TYPE: &str = "main-thread";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSide {
    Background,
    Main,
}

/// Wire record of a main-thread value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainThreadValueRecord {
    #[serde(rename = "__MT_PERSIST__")]
    pub persist: bool,
    pub id: i64,
    #[serde(rename = "initValue", default)]
    pub init_value: Value,
    #[serde(rename = "type", default = "default_type_name")]
    pub type_name: String,
}

fn default_type_name() -> String {
    MAIN_THREAD_REF_TYPE.to_string()
}

impl MainThreadValueRecord {
    pub fn new(id: i64, init_value: Value, type_name: impl Into<String>) -> Self {
        Self {
            persist: true,
            id,
            init_value,
            type_name: type_name.into(),
        }
    }

    /// Recognises both the persisted form and the older `_wvid` handle form.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;

        if object.get(MT_PERSIST_KEY).and_then(Value::as_bool) == Some(true) {
            return serde_json::from_value(value.clone()).ok();
        }

        let id = object.get("_wvid").and_then(Value::as_i64)?;
        let init_value = object.get("_initValue").cloned().unwrap_or(Value::Null);
        let type_name = object
            .get("_type")
            .and_then(Value::as_str)
            .unwrap_or(MAIN_THREAD_REF_TYPE);
        Some(Self::new(id, init_value, type_name))
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "__MT_PERSIST__": true,
            "id": self.id,
            "initValue": self.init_value,
            "type": self.type_name,
        })
    }

    pub fn is_first_screen(&self) -> bool {
        self.id < 0
    }
}

#[derive(Debug)]
struct ContextState {
    side: ThreadSide,
    minted: Cell<i64>,
    init_values: RefCell<Vec<InitValuePatch>>,
    released: RefCell<Vec<i64>>,
}

/// Per-side id counter plus the bookkeeping background handles report into.
#[derive(Debug, Clone)]
pub struct ValueContext {
    state: Rc<ContextState>,
}

impl ValueContext {
    pub fn new(side: ThreadSide) -> Self {
        Self {
            state: Rc::new(ContextState {
                side,
                minted: Cell::new(0),
                init_values: RefCell::new(Vec::new()),
                released: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn side(&self) -> ThreadSide {
        self.state.side
    }

    fn mint_id(&self) -> i64 {
        let next = self.state.minted.get() + 1;
        self.state.minted.set(next);
        match self.state.side {
            ThreadSide::Background => next,
            ThreadSide::Main => -next,
        }
    }

    /// Init values of handles minted since the last call, for the next patch.
    pub fn take_init_values(&self) -> Vec<InitValuePatch> {
        std::mem::take(&mut *self.state.init_values.borrow_mut())
    }

    /// Ids of background handles dropped since the last call.
    pub fn take_released(&self) -> Vec<i64> {
        std::mem::take(&mut *self.state.released.borrow_mut())
    }
}

/// A cheap handle to state owned by the main side.
///
/// On the background side the live value is unreachable: reads and writes
/// fail with [`ThreadAccessError`]. Dropping a background handle queues a
/// release for the main side.
pub struct MainThreadValue {
    record: MainThreadValueRecord,
    side: ThreadSide,
    current: RefCell<Value>,
    context: Weak<ContextState>,
}

impl fmt::Debug for MainThreadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainThreadValue")
            .field("id", &self.record.id)
            .field("type", &self.record.type_name)
            .field("side", &self.side)
            .finish()
    }
}

impl MainThreadValue {
    pub fn new(context: &ValueContext, init_value: Value, type_name: impl Into<String>) -> Self {
        let id = context.mint_id();
        let record = MainThreadValueRecord::new(id, init_value, type_name);

        if context.side() == ThreadSide::Background {
            context.state.init_values.borrow_mut().push(InitValuePatch(
                id,
                record.init_value.clone(),
                Some(record.type_name.clone()),
            ));
        }

        Self {
            current: RefCell::new(record.init_value.clone()),
            record,
            side: context.side(),
            context: Rc::downgrade(&context.state),
        }
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn init_value(&self) -> &Value {
        &self.record.init_value
    }

    pub fn type_name(&self) -> &str {
        &self.record.type_name
    }

    pub fn record(&self) -> &MainThreadValueRecord {
        &self.record
    }

    pub fn to_json(&self) -> Value {
        self.record.to_value()
    }

    pub fn value(&self) -> Result<Value, ThreadAccessError> {
        match self.side {
            ThreadSide::Main => Ok(self.current.borrow().clone()),
            ThreadSide::Background => Err(ThreadAccessError::Get {
                type_name: self.record.type_name.clone(),
            }),
        }
    }

    pub fn set_value(&self, value: Value) -> Result<(), ThreadAccessError> {
        match self.side {
            ThreadSide::Main => {
                *self.current.borrow_mut() = value;
                Ok(())
            }
            ThreadSide::Background => Err(ThreadAccessError::Set {
                type_name: self.record.type_name.clone(),
            }),
        }
    }
}

impl Serialize for MainThreadValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.record.serialize(serializer)
    }
}

impl Drop for MainThreadValue {
    fn drop(&mut self) {
        if self.side != ThreadSide::Background {
            return;
        }
        if let Some(state) = self.context.upgrade() {
            state.released.borrow_mut().push(self.record.id);
        }
    }
}

/// The `main-thread:ref` flavour of [`MainThreadValue`].
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct MainThreadRef(MainThreadValue);

impl MainThreadRef {
    pub fn new(context: &ValueContext, init_value: Value) -> Self {
        Self(MainThreadValue::new(context, init_value, MAIN_THREAD_REF_TYPE))
    }

    pub fn current(&self) -> Result<Value, ThreadAccessError> {
        self.0.value()
    }

    pub fn set_current(&self, value: Value) -> Result<(), ThreadAccessError> {
        self.0.set_value(value)
    }

    pub fn value(&self) -> &MainThreadValue {
        &self.0
    }

    pub fn to_json(&self) -> Value {
        self.0.to_json()
    }
}

pub type ValueFactory = Box<dyn Fn(&Value) -> Value>;

/// Maps a value type to the factory computing its initial main-side state.
pub struct ValueClassRegistry {
    factories: HashMap<String, ValueFactory>,
}

impl Default for ValueClassRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(MAIN_THREAD_REF_TYPE, |init_value| init_value.clone());
        registry
    }
}

impl fmt::Debug for ValueClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("ValueClassRegistry").field("types", &types).finish()
    }
}

impl ValueClassRegistry {
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Value + 'static,
    {
        self.factories.insert(type_name.into(), Box::new(factory));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    fn hydrate(&self, type_name: &str, init_value: &Value) -> Value {
        match self.factories.get(type_name) {
            Some(factory) => factory(init_value),
            None => {
                log::debug!("no main-thread value class for type '{type_name}'; using a plain ref");
                init_value.clone()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Current<E> {
    Value(Value),
    Element(E),
}

/// Main-side state behind one main-thread value id.
#[derive(Debug, Clone, PartialEq)]
pub struct HydratedValue<E> {
    pub id: i64,
    pub type_name: String,
    pub current: Current<E>,
}

impl<E> HydratedValue<E> {
    pub fn element(&self) -> Option<&E> {
        match &self.current {
            Current::Element(element) => Some(element),
            Current::Value(_) => None,
        }
    }

    pub fn bind_element(&mut self, element: Option<E>) {
        self.current = match element {
            Some(element) => Current::Element(element),
            None => Current::Value(Value::Null),
        };
    }
}

/// Main-side table of hydrated values. First-screen (negative) ids are kept
/// apart so they can be dropped wholesale once hydration completes.
#[derive(Debug)]
pub struct MainThreadValueStore<E> {
    classes: ValueClassRegistry,
    values: HashMap<i64, HydratedValue<E>>,
    first_screen: HashMap<i64, HydratedValue<E>>,
}

impl<E> Default for MainThreadValueStore<E> {
    fn default() -> Self {
        Self {
            classes: ValueClassRegistry::default(),
            values: HashMap::new(),
            first_screen: HashMap::new(),
        }
    }
}

impl<E> MainThreadValueStore<E> {
    pub fn new(classes: ValueClassRegistry) -> Self {
        Self {
            classes,
            values: HashMap::new(),
            first_screen: HashMap::new(),
        }
    }

    pub fn classes_mut(&mut self) -> &mut ValueClassRegistry {
        &mut self.classes
    }

    pub fn get(&self, id: i64) -> Option<&HydratedValue<E>> {
        if id < 0 {
            self.first_screen.get(&id)
        } else {
            self.values.get(&id)
        }
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut HydratedValue<E>> {
        if id < 0 {
            self.first_screen.get_mut(&id)
        } else {
            self.values.get_mut(&id)
        }
    }

    pub fn get_or_hydrate(&mut self, record: &MainThreadValueRecord) -> &mut HydratedValue<E> {
        let classes = &self.classes;
        let map = if record.is_first_screen() {
            &mut self.first_screen
        } else {
            &mut self.values
        };
        map.entry(record.id).or_insert_with(|| HydratedValue {
            id: record.id,
            type_name: record.type_name.clone(),
            current: Current::Value(classes.hydrate(&record.type_name, &record.init_value)),
        })
    }

    /// Existing entries take the new value; unknown ids are hydrated.
    /// Negative ids land in the first-screen table like any other lookup.
    pub fn apply_init_value_changes(&mut self, changes: &[InitValuePatch]) {
        for change in changes {
            let id = change.id();
            if let Some(existing) = self.get_mut(id) {
                existing.current = Current::Value(change.init_value().clone());
                continue;
            }
            let type_name = change.type_name().unwrap_or(MAIN_THREAD_REF_TYPE);
            let current = self.classes.hydrate(type_name, change.init_value());
            let map = if id < 0 {
                &mut self.first_screen
            } else {
                &mut self.values
            };
            map.insert(
                id,
                HydratedValue {
                    id,
                    type_name: type_name.to_string(),
                    current: Current::Value(current),
                },
            );
        }
    }

    pub fn release(&mut self, id: i64) -> bool {
        let normal = self.values.remove(&id).is_some();
        let first_screen = self.first_screen.remove(&id).is_some();
        normal || first_screen
    }

    pub fn clear_first_screen(&mut self) {
        self.first_screen.clear();
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.first_screen.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len() + self.first_screen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
