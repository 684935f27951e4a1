//! Per-session control registry: wire id assignment, lookup, and tree
//! serialization into the patch wire format.

use std::collections::{HashMap, HashSet};

use crate::control::{Control, Prop};
use crate::props;
use crate::value::{Value, ValueMap};

/// Wire id of the page itself.
pub const PAGE_ID: i64 = 1;
/// Wire id of the session-owned overlay container.
pub const OVERLAY_ID: i64 = 2;
/// Wire id of the session-owned dialog container.
pub const DIALOGS_ID: i64 = 3;
/// Wire id of the implicit root view.
pub const VIEW_ID: i64 = 20;
/// First wire id handed to application controls.
pub const FIRST_APP_ID: i64 = 100;

/// Something an operation can be addressed to.
#[derive(Debug, Clone)]
pub enum Target {
    Page,
    Wire(i64),
    Name(String),
    Control(Control),
}

impl Target {
    /// Whether this target denotes the page (`1`, `"1"` or `"page"`).
    pub fn is_page(&self) -> bool {
        match self {
            Target::Page => true,
            Target::Wire(id) => *id == PAGE_ID,
            Target::Name(name) => name == "page" || name == "1",
            Target::Control(_) => false,
        }
    }
}

impl From<&Control> for Target {
    fn from(c: &Control) -> Self {
        Target::Control(c.clone())
    }
}

impl From<i64> for Target {
    fn from(id: i64) -> Self {
        Target::Wire(id)
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Name(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Name(name)
    }
}

impl From<&Value> for Target {
    fn from(v: &Value) -> Self {
        match v.as_i64() {
            Some(id) if !matches!(v, Value::Str(_)) => Target::Wire(id),
            _ => Target::Name(v.to_key_string()),
        }
    }
}

pub struct ControlRegistry {
    next_wire_id: i64,
    by_wire: HashMap<i64, Control>,
    by_name: HashMap<String, Control>,
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self {
            next_wire_id: FIRST_APP_ID,
            by_wire: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// The id the next unregistered control will receive.
    pub fn next_wire_id(&self) -> i64 {
        self.next_wire_id
    }

    pub fn len(&self) -> usize {
        self.by_wire.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_wire.is_empty()
    }

    /// Register every control reachable from `roots`.
    pub fn register(&mut self, roots: &[Control]) {
        let mut visited = HashSet::new();
        for root in roots {
            self.register_tree(root, &mut visited);
        }
    }

    /// Rebuild the lookup maps from scratch for the current root set.
    ///
    /// Wire ids already assigned are kept; only the indexes are rebuilt, so
    /// controls dropped from the tree stop resolving.
    pub fn refresh<'a>(&mut self, roots: &[Control], embedded: impl IntoIterator<Item = &'a Prop>) {
        self.by_wire.clear();
        self.by_name.clear();
        let mut visited = HashSet::new();
        for root in roots {
            self.register_tree(root, &mut visited);
        }
        for prop in embedded {
            self.register_prop(prop, &mut visited);
        }
    }

    /// Depth-first pre-order walk. `visited` holds control identities and
    /// stops a shared or cyclic node from being walked twice.
    pub fn register_tree(&mut self, control: &Control, visited: &mut HashSet<usize>) {
        if !visited.insert(control.identity()) {
            return;
        }

        let wire_id = control.assign_wire_id(self.next_wire_id);
        if wire_id >= self.next_wire_id {
            self.next_wire_id = wire_id + 1;
        }
        self.by_wire.insert(wire_id, control.clone());
        self.by_name.insert(control.local_id(), control.clone());

        for child in control.children() {
            self.register_tree(&child, visited);
        }
        for prop in control.props().values() {
            self.register_prop(prop, visited);
        }
    }

    pub fn register_prop(&mut self, prop: &Prop, visited: &mut HashSet<usize>) {
        let mut found = Vec::new();
        prop.for_each_control(&mut |c| found.push(c.clone()));
        for control in &found {
            self.register_tree(control, visited);
        }
    }

    /// Look up a target. Digit-only names are treated as wire ids.
    pub fn resolve(&self, target: &Target) -> Option<Control> {
        match target {
            Target::Page => None,
            Target::Wire(id) => self.by_wire.get(id).cloned(),
            Target::Name(name) => match Value::from(name.as_str()).as_i64() {
                Some(id) => self.by_wire.get(&id).cloned(),
                None => self.by_name.get(name).cloned(),
            },
            Target::Control(c) => c.wire_id().map(|_| c.clone()),
        }
    }

    /// Whether `control` is currently indexed under its wire id.
    pub fn contains(&self, control: &Control) -> bool {
        control
            .wire_id()
            .and_then(|id| self.by_wire.get(&id))
            .is_some_and(|c| c.ptr_eq(control))
    }

    /// Serialize a control and its subtree into its wire form.
    pub fn serialize(control: &Control) -> Value {
        serialize_control(control, &mut HashSet::new())
    }

    /// Serialize a property value, expanding any embedded controls.
    pub fn serialize_prop(prop: &Prop) -> Value {
        serialize_prop_inner(prop, &mut HashSet::new())
    }
}

fn serialize_control(control: &Control, ancestors: &mut HashSet<usize>) -> Value {
    let kind = control.kind();
    let mut out = ValueMap::new();
    out.insert("_c".into(), Value::from(props::class_name(&kind)));
    out.insert("_i".into(), Value::from(control.wire_id()));

    // A control nested inside itself is emitted as a bare reference.
    if !ancestors.insert(control.identity()) {
        return Value::Map(out);
    }

    if props::is_positioned(&kind) {
        out.insert("_internals".into(), crate::value_map! {"host_positioned" => true});
    } else if props::is_expanding(&kind) {
        out.insert("_internals".into(), crate::value_map! {"host_expanded" => true});
    }

    for (key, prop) in control.props() {
        out.insert(key, serialize_prop_inner(&prop, ancestors));
    }

    let children = control.children();
    if !children.is_empty() {
        let serialized = children
            .iter()
            .map(|child| serialize_control(child, ancestors))
            .collect();
        out.insert("controls".into(), Value::List(serialized));
    }

    ancestors.remove(&control.identity());
    Value::Map(out)
}

fn serialize_prop_inner(prop: &Prop, ancestors: &mut HashSet<usize>) -> Value {
    match prop {
        Prop::Value(v) => v.clone(),
        Prop::Control(c) => serialize_control(c, ancestors),
        Prop::List(items) => Value::List(
            items
                .iter()
                .map(|p| serialize_prop_inner(p, ancestors))
                .collect(),
        ),
        Prop::Map(map) => Value::Map(
            map.iter()
                .map(|(k, p)| (k.clone(), serialize_prop_inner(p, ancestors)))
                .collect(),
        ),
    }
}
