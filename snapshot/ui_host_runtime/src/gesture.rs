//! Gesture composition.
//!
//! Leaf gestures carry relation lists (`simultaneousWith`, `waitFor`,
//! `continueWith`) naming other leaves. Composing gestures propagates
//! relations into every leaf once, at construction. Relations are stored as
//! gesture ids so leaves that refer to each other do not form `Rc` cycles.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GESTURE_ID: AtomicU64 = AtomicU64::new(1);

pub const COMPOSED_GESTURE_TYPE: i32 = -1;

/// Pan threshold used when a pan is composed with a tap or long press. Matches
/// the default tap slop so the discrete gesture gets to recognise first.
pub const PAN_MIN_DISTANCE_WITH_DISCRETE: f64 = 10.0;

const MIN_DISTANCE_KEY: &str = "minDistance";
const EXEC_ID_KEY: &str = "_execId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct GestureId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureKind {
    Pan,
    Fling,
    Default,
    Tap,
    LongPress,
    Rotation,
    Pinch,
    Native,
}

impl GestureKind {
    pub fn code(self) -> i32 {
        match self {
            GestureKind::Pan => 0,
            GestureKind::Fling => 1,
            GestureKind::Default => 2,
            GestureKind::Tap => 3,
            GestureKind::LongPress => 4,
            GestureKind::Rotation => 5,
            GestureKind::Pinch => 6,
            GestureKind::Native => 7,
        }
    }

    fn is_discrete(self) -> bool {
        matches!(self, GestureKind::Tap | GestureKind::LongPress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposedKind {
    Composed,
    Simultaneous,
    Exclusive,
    Race,
}

impl ComposedKind {
    pub fn name(self) -> &'static str {
        match self {
            ComposedKind::Composed => "composed",
            ComposedKind::Simultaneous => "simultaneous",
            ComposedKind::Exclusive => "exclusive",
            ComposedKind::Race => "race",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Relation {
    SimultaneousWith,
    WaitFor,
    ContinueWith,
}

#[derive(Debug, Clone)]
pub struct BaseGesture {
    id: GestureId,
    kind: GestureKind,
    config: Map<String, Value>,
    callbacks: Map<String, Value>,
    exec_id: u64,
    simultaneous_with: Vec<GestureId>,
    wait_for: Vec<GestureId>,
    continue_with: Vec<GestureId>,
}

impl BaseGesture {
    fn new(kind: GestureKind) -> Self {
        let mut config = Map::new();
        config.insert("enabled".to_string(), Value::Bool(true));
        Self {
            id: GestureId(NEXT_GESTURE_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            config,
            callbacks: Map::new(),
            exec_id: 0,
            simultaneous_with: Vec::new(),
            wait_for: Vec::new(),
            continue_with: Vec::new(),
        }
    }

    fn relation_mut(&mut self, relation: Relation) -> &mut Vec<GestureId> {
        match relation {
            Relation::SimultaneousWith => &mut self.simultaneous_with,
            Relation::WaitFor => &mut self.wait_for,
            Relation::ContinueWith => &mut self.continue_with,
        }
    }
}

/// Shared handle to a leaf gesture. Cloning the handle does not copy the
/// gesture; use [`LeafGesture::clone_gesture`] for that.
#[derive(Debug, Clone)]
pub struct LeafGesture(Rc<RefCell<BaseGesture>>);

impl LeafGesture {
    pub fn new(kind: GestureKind) -> Self {
        Self(Rc::new(RefCell::new(BaseGesture::new(kind))))
    }

    pub fn pan() -> Self {
        Self::new(GestureKind::Pan)
    }

    pub fn fling() -> Self {
        Self::new(GestureKind::Fling)
    }

    pub fn default_gesture() -> Self {
        Self::new(GestureKind::Default)
    }

    pub fn tap() -> Self {
        Self::new(GestureKind::Tap)
    }

    pub fn long_press() -> Self {
        Self::new(GestureKind::LongPress)
    }

    pub fn rotation() -> Self {
        Self::new(GestureKind::Rotation)
    }

    pub fn pinch() -> Self {
        Self::new(GestureKind::Pinch)
    }

    pub fn native() -> Self {
        Self::new(GestureKind::Native)
    }

    pub fn id(&self) -> GestureId {
        self.0.borrow().id
    }

    pub fn kind(&self) -> GestureKind {
        self.0.borrow().kind
    }

    pub fn exec_id(&self) -> u64 {
        self.0.borrow().exec_id
    }

    pub fn config(&self) -> Map<String, Value> {
        self.0.borrow().config.clone()
    }

    pub fn callbacks(&self) -> Map<String, Value> {
        self.0.borrow().callbacks.clone()
    }

    pub fn simultaneous_with(&self) -> Vec<GestureId> {
        self.0.borrow().simultaneous_with.clone()
    }

    pub fn wait_for(&self) -> Vec<GestureId> {
        self.0.borrow().wait_for.clone()
    }

    pub fn continue_with(&self) -> Vec<GestureId> {
        self.0.borrow().continue_with.clone()
    }

    pub fn ptr_eq(&self, other: &LeafGesture) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn update_config(self, key: &str, value: Value) -> Self {
        {
            let mut gesture = self.0.borrow_mut();
            gesture.exec_id += 1;
            gesture.config.insert(key.to_string(), value);
        }
        self
    }

    pub fn enabled(self, enabled: bool) -> Self {
        self.update_config("enabled", Value::Bool(enabled))
    }

    pub fn min_distance(self, distance: f64) -> Self {
        self.update_config(MIN_DISTANCE_KEY, json!(distance))
    }

    fn update_callback(self, name: &str, worklet: Value) -> Self {
        {
            let mut gesture = self.0.borrow_mut();
            gesture.exec_id += 1;
            gesture.callbacks.insert(name.to_string(), worklet);
        }
        self
    }

    pub fn on_begin(self, worklet: Value) -> Self {
        self.update_callback("onBegin", worklet)
    }

    pub fn on_start(self, worklet: Value) -> Self {
        self.update_callback("onStart", worklet)
    }

    pub fn on_update(self, worklet: Value) -> Self {
        self.update_callback("onUpdate", worklet)
    }

    pub fn on_end(self, worklet: Value) -> Self {
        self.update_callback("onEnd", worklet)
    }

    pub fn on_touches_down(self, worklet: Value) -> Self {
        self.update_callback("onTouchesDown", worklet)
    }

    pub fn on_touches_move(self, worklet: Value) -> Self {
        self.update_callback("onTouchesMove", worklet)
    }

    pub fn on_touches_up(self, worklet: Value) -> Self {
        self.update_callback("onTouchesUp", worklet)
    }

    pub fn on_touches_cancel(self, worklet: Value) -> Self {
        self.update_callback("onTouchesCancel", worklet)
    }

    pub fn external_wait_for(self, other: &Gesture) -> Self {
        self.extend_external(Relation::WaitFor, other)
    }

    pub fn external_simultaneous(self, other: &Gesture) -> Self {
        self.extend_external(Relation::SimultaneousWith, other)
    }

    pub fn external_continue_with(self, other: &Gesture) -> Self {
        self.extend_external(Relation::ContinueWith, other)
    }

    fn extend_external(self, relation: Relation, other: &Gesture) -> Self {
        if let Gesture::Base(leaf) = other {
            if leaf.ptr_eq(&self) {
                return self;
            }
        }

        let ids = leaf_ids(&other.to_gesture_array());
        {
            let mut gesture = self.0.borrow_mut();
            gesture.exec_id += 1;
            gesture.relation_mut(relation).extend(ids);
        }
        self
    }

    /// Independent copy sharing the same id.
    pub fn clone_gesture(&self) -> LeafGesture {
        LeafGesture(Rc::new(RefCell::new(self.0.borrow().clone())))
    }

    pub fn serialize(&self) -> Value {
        let gesture = self.0.borrow();
        leaf_json(
            gesture.id,
            gesture.kind,
            &gesture.config,
            &gesture.callbacks,
            [
                gesture.simultaneous_with.as_slice(),
                gesture.wait_for.as_slice(),
                gesture.continue_with.as_slice(),
            ],
        )
    }

    fn extend_relations(&self, simultaneous_with: &[GestureId], wait_for: &[GestureId]) {
        let mut gesture = self.0.borrow_mut();
        gesture.simultaneous_with.extend_from_slice(simultaneous_with);
        gesture.wait_for.extend_from_slice(wait_for);
    }

    fn override_default_min_distance(&self) {
        let mut gesture = self.0.borrow_mut();
        if !gesture.config.contains_key(MIN_DISTANCE_KEY) {
            gesture
                .config
                .insert(MIN_DISTANCE_KEY.to_string(), json!(PAN_MIN_DISTANCE_WITH_DISCRETE));
        }
    }
}

#[derive(Debug)]
pub struct ComposedGesture {
    kind: ComposedKind,
    gestures: Vec<Gesture>,
    simultaneous_with: Vec<GestureId>,
    wait_for: Vec<GestureId>,
    pan_processed: bool,
}

#[derive(Debug, Clone)]
pub enum Gesture {
    Base(LeafGesture),
    Composed(Rc<RefCell<ComposedGesture>>),
}

impl From<LeafGesture> for Gesture {
    fn from(leaf: LeafGesture) -> Self {
        Gesture::Base(leaf)
    }
}

impl Gesture {
    pub fn composed(gestures: Vec<Gesture>) -> Self {
        Self::compose(ComposedKind::Composed, gestures)
    }

    pub fn simultaneous(gestures: Vec<Gesture>) -> Self {
        Self::compose(ComposedKind::Simultaneous, gestures)
    }

    pub fn exclusive(gestures: Vec<Gesture>) -> Self {
        Self::compose(ComposedKind::Exclusive, gestures)
    }

    pub fn race(gestures: Vec<Gesture>) -> Self {
        Self::compose(ComposedKind::Race, gestures)
    }

    fn compose(kind: ComposedKind, gestures: Vec<Gesture>) -> Self {
        let mut composed = ComposedGesture {
            kind,
            gestures,
            simultaneous_with: Vec::new(),
            wait_for: Vec::new(),
            pan_processed: false,
        };
        prepare(&mut composed);
        Gesture::Composed(Rc::new(RefCell::new(composed)))
    }

    pub fn type_code(&self) -> i32 {
        match self {
            Gesture::Base(leaf) => leaf.kind().code(),
            Gesture::Composed(_) => COMPOSED_GESTURE_TYPE,
        }
    }

    pub fn composed_kind(&self) -> Option<ComposedKind> {
        match self {
            Gesture::Base(_) => None,
            Gesture::Composed(composed) => Some(composed.borrow().kind),
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafGesture> {
        match self {
            Gesture::Base(leaf) => Some(leaf),
            Gesture::Composed(_) => None,
        }
    }

    pub fn children(&self) -> Vec<Gesture> {
        match self {
            Gesture::Base(_) => Vec::new(),
            Gesture::Composed(composed) => composed.borrow().gestures.clone(),
        }
    }

    pub fn pan_processed(&self) -> bool {
        match self {
            Gesture::Base(_) => false,
            Gesture::Composed(composed) => composed.borrow().pan_processed,
        }
    }

    fn ptr_eq(&self, other: &Gesture) -> bool {
        match (self, other) {
            (Gesture::Base(a), Gesture::Base(b)) => a.ptr_eq(b),
            (Gesture::Composed(a), Gesture::Composed(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Leaf gestures in order; composed containers are flattened away.
    pub fn to_gesture_array(&self) -> Vec<LeafGesture> {
        match self {
            Gesture::Base(leaf) => vec![leaf.clone()],
            Gesture::Composed(composed) => composed
                .borrow()
                .gestures
                .iter()
                .flat_map(Gesture::to_gesture_array)
                .collect(),
        }
    }

    /// Gives pans a larger default threshold when a tap or long press shares
    /// the composition. Runs at most once per composed gesture.
    pub fn process_pan_distance(&self) {
        let Gesture::Composed(composed) = self else {
            return;
        };
        {
            let mut composed = composed.borrow_mut();
            if composed.pan_processed {
                return;
            }
            composed.pan_processed = true;
        }

        let leaves = self.to_gesture_array();
        if !leaves.iter().any(|leaf| leaf.kind().is_discrete()) {
            return;
        }
        for pan in leaves.iter().filter(|leaf| leaf.kind() == GestureKind::Pan) {
            pan.override_default_min_distance();
        }
    }

    pub fn serialize(&self) -> Value {
        match self {
            Gesture::Base(leaf) => leaf.serialize(),
            Gesture::Composed(composed) => {
                let composed = composed.borrow();
                let gestures: Vec<Value> =
                    composed.gestures.iter().map(Gesture::serialize).collect();
                composed_json(composed.kind, gestures)
            }
        }
    }
}

fn leaf_ids(leaves: &[LeafGesture]) -> Vec<GestureId> {
    leaves.iter().map(LeafGesture::id).collect()
}

fn prepare(composed: &mut ComposedGesture) {
    match composed.kind {
        ComposedKind::Composed | ComposedKind::Race => {
            for gesture in &composed.gestures {
                prepare_single(gesture, &composed.simultaneous_with, &composed.wait_for);
            }
        }
        ComposedKind::Simultaneous => {
            // Each child is simultaneous with the leaves of its siblings only,
            // so an exclusive child keeps its own members exclusive.
            let others: Vec<Vec<GestureId>> = composed
                .gestures
                .iter()
                .map(|gesture| {
                    let siblings: Vec<LeafGesture> = composed
                        .gestures
                        .iter()
                        .filter(|other| !other.ptr_eq(gesture))
                        .flat_map(Gesture::to_gesture_array)
                        .collect();
                    leaf_ids(&siblings)
                })
                .collect();

            for (gesture, simultaneous_with) in composed.gestures.iter().zip(&others) {
                prepare_single(gesture, simultaneous_with, &composed.wait_for);
            }
        }
        ComposedKind::Exclusive => {
            let groups: Vec<Vec<GestureId>> = composed
                .gestures
                .iter()
                .map(|gesture| leaf_ids(&gesture.to_gesture_array()))
                .collect();

            let mut require_to_fail: Vec<GestureId> = Vec::new();
            for (gesture, group) in composed.gestures.iter().zip(groups) {
                let mut wait_for = composed.wait_for.clone();
                wait_for.extend_from_slice(&require_to_fail);
                prepare_single(gesture, &composed.simultaneous_with, &wait_for);
                require_to_fail.extend(group);
            }
        }
    }
}

fn prepare_single(gesture: &Gesture, simultaneous_with: &[GestureId], wait_for: &[GestureId]) {
    match gesture {
        Gesture::Base(leaf) => leaf.extend_relations(simultaneous_with, wait_for),
        Gesture::Composed(composed) => {
            let mut composed = composed.borrow_mut();
            composed.simultaneous_with = simultaneous_with.to_vec();
            composed.wait_for = wait_for.to_vec();
            prepare(&mut composed);
        }
    }
}

fn relation_json(ids: &[GestureId]) -> Value {
    Value::Array(ids.iter().map(|id| json!({ "id": id })).collect())
}

fn leaf_json(
    id: GestureId,
    kind: GestureKind,
    config: &Map<String, Value>,
    callbacks: &Map<String, Value>,
    [simultaneous_with, wait_for, continue_with]: [&[GestureId]; 3],
) -> Value {
    json!({
        "config": config,
        "id": id,
        "type": kind.code(),
        "simultaneousWith": relation_json(simultaneous_with),
        "waitFor": relation_json(wait_for),
        "continueWith": relation_json(continue_with),
        "callbacks": callbacks,
        "__isSerialized": true,
    })
}

fn composed_json(kind: ComposedKind, gestures: Vec<Value>) -> Value {
    json!({
        "type": COMPOSED_GESTURE_TYPE,
        "composition": kind.name(),
        "gestures": gestures,
        "__isSerialized": true,
    })
}

/// Hands out the execution ids stamped into committed worklet copies.
#[derive(Debug, Default)]
pub struct ExecIdAllocator {
    last: u64,
}

impl ExecIdAllocator {
    pub fn next_id(&mut self) -> u64 {
        self.last += 1;
        self.last
    }
}

/// Frozen copy of a gesture graph, ready to cross the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum CommittedGesture {
    Composed {
        kind: ComposedKind,
        gestures: Vec<CommittedGesture>,
    },
    Base {
        id: GestureId,
        kind: GestureKind,
        config: Map<String, Value>,
        callbacks: Map<String, Value>,
        simultaneous_with: Vec<GestureId>,
        wait_for: Vec<GestureId>,
        continue_with: Vec<GestureId>,
    },
}

impl CommittedGesture {
    pub fn to_json(&self) -> Value {
        match self {
            CommittedGesture::Composed { kind, gestures } => {
                composed_json(*kind, gestures.iter().map(CommittedGesture::to_json).collect())
            }
            CommittedGesture::Base {
                id,
                kind,
                config,
                callbacks,
                simultaneous_with,
                wait_for,
                continue_with,
            } => leaf_json(
                *id,
                *kind,
                config,
                callbacks,
                [
                    simultaneous_with.as_slice(),
                    wait_for.as_slice(),
                    continue_with.as_slice(),
                ],
            ),
        }
    }
}

impl Serialize for CommittedGesture {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Copies `gesture` for transfer. Each worklet callback in the copy gets a
/// fresh `_execId`; the live gesture is left untouched.
pub fn prepare_gesture_for_commit(
    gesture: &Gesture,
    exec_ids: &mut ExecIdAllocator,
) -> CommittedGesture {
    match gesture {
        Gesture::Composed(composed) => {
            let composed = composed.borrow();
            CommittedGesture::Composed {
                kind: composed.kind,
                gestures: composed
                    .gestures
                    .iter()
                    .map(|child| prepare_gesture_for_commit(child, exec_ids))
                    .collect(),
            }
        }
        Gesture::Base(leaf) => {
            let leaf = leaf.0.borrow();
            let callbacks = leaf
                .callbacks
                .iter()
                .map(|(name, callback)| {
                    let committed = match callback {
                        Value::Object(worklet) => {
                            let mut copy = worklet.clone();
                            copy.insert(EXEC_ID_KEY.to_string(), json!(exec_ids.next_id()));
                            Value::Object(copy)
                        }
                        other => other.clone(),
                    };
                    (name.clone(), committed)
                })
                .collect();

            CommittedGesture::Base {
                id: leaf.id,
                kind: leaf.kind,
                config: leaf.config.clone(),
                callbacks,
                simultaneous_with: leaf.simultaneous_with.clone(),
                wait_for: leaf.wait_for.clone(),
                continue_with: leaf.continue_with.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(leaf: &LeafGesture) -> Gesture {
        leaf.clone().into()
    }

    #[test]
    fn composing_extends_existing_leaf_relations() {
        let a = LeafGesture::pan();
        let b = LeafGesture::tap();
        let leaf = LeafGesture::pinch().external_simultaneous(&g(&a));
        assert_eq!(leaf.simultaneous_with(), vec![a.id()]);

        let _group = Gesture::simultaneous(vec![g(&leaf), g(&b)]);
        assert_eq!(leaf.simultaneous_with(), vec![a.id(), b.id()]);
    }

    #[test]
    fn exclusive_groups_wait_for_every_earlier_group() {
        let t1 = LeafGesture::tap();
        let t2 = LeafGesture::long_press();
        let g2 = LeafGesture::pan();
        let g3 = LeafGesture::fling();
        let g1 = Gesture::simultaneous(vec![g(&t1), g(&t2)]);

        let _exclusive = Gesture::exclusive(vec![g1, g(&g2), g(&g3)]);

        assert_eq!(g2.wait_for(), vec![t1.id(), t2.id()]);
        assert_eq!(g3.wait_for(), vec![t1.id(), t2.id(), g2.id()]);
        assert!(t1.wait_for().is_empty());
        assert!(!g2.wait_for().contains(&g3.id()));
    }

    #[test]
    fn simultaneous_excludes_members_of_the_same_child() {
        let a = LeafGesture::tap();
        let b = LeafGesture::long_press();
        let c = LeafGesture::pan();
        let exclusive = Gesture::exclusive(vec![g(&a), g(&b)]);

        let _group = Gesture::simultaneous(vec![exclusive, g(&c)]);

        assert_eq!(a.simultaneous_with(), vec![c.id()]);
        assert_eq!(b.simultaneous_with(), vec![c.id()]);
        assert_eq!(c.simultaneous_with(), vec![a.id(), b.id()]);
        // Wrapping re-prepares the exclusive child; leaf lists only grow.
        assert_eq!(b.wait_for(), vec![a.id(), a.id()]);
        assert!(a.wait_for().is_empty());
    }

    #[test]
    fn race_passes_parent_relations_through() {
        let a = LeafGesture::pan();
        let b = LeafGesture::pinch();
        let c = LeafGesture::rotation();
        let race = Gesture::race(vec![g(&a), g(&b)]);
        assert!(a.simultaneous_with().is_empty());
        assert_eq!(race.composed_kind(), Some(ComposedKind::Race));

        let _group = Gesture::simultaneous(vec![race, g(&c)]);
        assert_eq!(a.simultaneous_with(), vec![c.id()]);
        assert_eq!(b.simultaneous_with(), vec![c.id()]);
        assert!(a.wait_for().is_empty());
    }

    #[test]
    fn gesture_array_flattens_in_order() {
        let a = LeafGesture::tap();
        let b = LeafGesture::pan();
        let c = LeafGesture::pinch();
        let d = LeafGesture::native();
        let composed = Gesture::composed(vec![
            g(&a),
            Gesture::simultaneous(vec![g(&b), g(&c)]),
            g(&d),
        ]);

        let ids = leaf_ids(&composed.to_gesture_array());
        assert_eq!(ids, vec![a.id(), b.id(), c.id(), d.id()]);
    }

    #[test]
    fn empty_and_single_compositions_are_harmless() {
        let empty = Gesture::simultaneous(Vec::new());
        assert!(empty.to_gesture_array().is_empty());
        empty.process_pan_distance();
        assert!(empty.pan_processed());

        let only = LeafGesture::tap();
        let single = Gesture::exclusive(vec![g(&only)]);
        assert_eq!(single.to_gesture_array().len(), 1);
        assert!(only.wait_for().is_empty());
        assert!(only.simultaneous_with().is_empty());
    }

    #[test]
    fn pan_distance_is_overridden_once_next_to_a_tap() {
        let pan = LeafGesture::pan();
        let tap = LeafGesture::tap();
        let composed = Gesture::simultaneous(vec![g(&pan), g(&tap)]);

        composed.process_pan_distance();
        assert!(composed.pan_processed());
        let first = pan.config();
        assert_eq!(first.get("minDistance"), Some(&json!(PAN_MIN_DISTANCE_WITH_DISCRETE)));

        pan.clone().update_config("minDistance", json!(1.0));
        composed.process_pan_distance();
        assert_eq!(pan.config().get("minDistance"), Some(&json!(1.0)));
        assert!(composed.pan_processed());
    }

    #[test]
    fn explicit_min_distance_is_kept() {
        let pan = LeafGesture::pan().min_distance(3.0);
        let composed = Gesture::composed(vec![g(&pan), LeafGesture::long_press().into()]);
        composed.process_pan_distance();
        assert_eq!(pan.config().get("minDistance"), Some(&json!(3.0)));
    }

    #[test]
    fn pan_without_discrete_gesture_keeps_default() {
        let pan = LeafGesture::pan();
        let composed = Gesture::simultaneous(vec![g(&pan), LeafGesture::pinch().into()]);
        composed.process_pan_distance();
        assert!(pan.config().get("minDistance").is_none());
    }

    #[test]
    fn external_relations_skip_self_and_flatten() {
        let a = LeafGesture::tap();
        let b = LeafGesture::pan();
        let c = LeafGesture::pinch();
        let composed = Gesture::race(vec![g(&b), g(&c)]);

        let itself = g(&a);
        let a = a.external_wait_for(&itself);
        assert!(a.wait_for().is_empty());
        assert_eq!(a.exec_id(), 0);

        let a = a.external_wait_for(&composed).external_continue_with(&g(&b));
        assert_eq!(a.wait_for(), vec![b.id(), c.id()]);
        assert_eq!(a.continue_with(), vec![b.id()]);
        assert_eq!(a.exec_id(), 2);
    }

    #[test]
    fn clone_gesture_shares_id_but_not_state() {
        let original = LeafGesture::tap().enabled(false);
        let copy = original.clone_gesture();
        assert_eq!(copy.id(), original.id());
        assert!(!copy.ptr_eq(&original));

        let copy = copy.enabled(true);
        assert_eq!(original.config().get("enabled"), Some(&json!(false)));
        assert_eq!(copy.config().get("enabled"), Some(&json!(true)));
    }

    #[test]
    fn serializes_leaf_and_composed_shapes() {
        let a = LeafGesture::tap();
        let b = LeafGesture::pan();
        let composed = Gesture::simultaneous(vec![g(&a), g(&b)]);

        let value = composed.serialize();
        assert_eq!(value["type"], json!(-1));
        assert_eq!(value["composition"], json!("simultaneous"));
        assert_eq!(value["__isSerialized"], json!(true));
        assert_eq!(value["gestures"][0]["id"], json!(a.id().0));
        assert_eq!(value["gestures"][0]["type"], json!(3));
        assert_eq!(value["gestures"][0]["simultaneousWith"], json!([{ "id": b.id().0 }]));
        assert_eq!(value["gestures"][1]["config"], json!({ "enabled": true }));
    }

    #[test]
    fn commit_copies_callbacks_without_touching_the_original() {
        let tap = LeafGesture::tap().on_start(json!({ "_wkltId": "a1" }));
        let pan = LeafGesture::pan().on_update(json!({ "_wkltId": "b2" }));
        let composed = Gesture::exclusive(vec![g(&tap), g(&pan)]);
        let before = composed.serialize();
        let exec_before = tap.exec_id();

        let mut exec_ids = ExecIdAllocator::default();
        let committed = prepare_gesture_for_commit(&composed, &mut exec_ids);
        let payload = committed.to_json();

        assert_eq!(payload["gestures"][0]["callbacks"]["onStart"]["_execId"], json!(1));
        assert_eq!(payload["gestures"][1]["callbacks"]["onUpdate"]["_execId"], json!(2));
        assert_eq!(payload["gestures"][1]["waitFor"], json!([{ "id": tap.id().0 }]));
        assert_eq!(composed.serialize(), before);
        assert_eq!(tap.exec_id(), exec_before);
        assert!(tap.callbacks()["onStart"].get("_execId").is_none());

        let again = prepare_gesture_for_commit(&composed, &mut exec_ids);
        assert_ne!(again, committed);
        let again = serde_json::to_value(&again).expect("serialize");
        assert_eq!(again["gestures"][0]["callbacks"]["onStart"]["_execId"], json!(3));
    }
}
