//! Control nodes: the server-side mirror of a remotely rendered widget.
//!
//! A [`Control`] is a cheap, clonable handle. Clones share one node, and node
//! identity is the handle's allocation, so a control embedded at two sites
//! of a tree is still one node with one wire id.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::event::Event;
use crate::page::Page;
use crate::value::Value;

/// Application callback attached to a control or to the page.
pub type Handler = Arc<dyn Fn(&mut Page, &Event) -> anyhow::Result<()> + Send + Sync>;

/// A property value: plain data, or controls embedded in the property bag
/// (e.g. a dialog's `content` or an app bar's `actions`).
#[derive(Clone)]
pub enum Prop {
    Value(Value),
    Control(Control),
    List(Vec<Prop>),
    Map(BTreeMap<String, Prop>),
}

impl Prop {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Prop::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Visit every control reachable through this property, in order.
    pub fn for_each_control(&self, f: &mut dyn FnMut(&Control)) {
        match self {
            Prop::Value(_) => {}
            Prop::Control(c) => f(c),
            Prop::List(items) => items.iter().for_each(|p| p.for_each_control(f)),
            Prop::Map(map) => map.values().for_each(|p| p.for_each_control(f)),
        }
    }
}

impl fmt::Debug for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prop::Value(v) => write!(f, "{v:?}"),
            Prop::Control(c) => write!(f, "{c:?}"),
            Prop::List(items) => f.debug_list().entries(items).finish(),
            Prop::Map(map) => f.debug_map().entries(map).finish(),
        }
    }
}

impl From<Value> for Prop {
    fn from(v: Value) -> Self {
        Prop::Value(v)
    }
}

impl From<Control> for Prop {
    fn from(c: Control) -> Self {
        Prop::Control(c)
    }
}

impl From<&Control> for Prop {
    fn from(c: &Control) -> Self {
        Prop::Control(c.clone())
    }
}

impl From<Vec<Control>> for Prop {
    fn from(items: Vec<Control>) -> Self {
        Prop::List(items.into_iter().map(Prop::Control).collect())
    }
}

impl From<Vec<Prop>> for Prop {
    fn from(items: Vec<Prop>) -> Self {
        Prop::List(items)
    }
}

macro_rules! prop_from_value {
    ($($t:ty),*) => {$(
        impl From<$t> for Prop {
            fn from(v: $t) -> Self {
                Prop::Value(Value::from(v))
            }
        }
    )*};
}

prop_from_value!(bool, i32, i64, u32, u64, usize, f64, &str, String);

pub struct ControlNode {
    kind: String,
    local_id: String,
    wire_id: Option<i64>,
    props: BTreeMap<String, Prop>,
    children: Vec<Control>,
    handlers: HashMap<String, Handler>,
}

#[derive(Clone)]
pub struct Control(Arc<RwLock<ControlNode>>);

impl Control {
    /// Create a control of the given kind with a generated local id.
    pub fn new(kind: impl Into<String>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(Arc::new(RwLock::new(ControlNode {
            kind: kind.into().to_lowercase(),
            local_id: format!("ctrl_{}", &suffix[..8]),
            wire_id: None,
            props: BTreeMap::new(),
            children: Vec::new(),
            handlers: HashMap::new(),
        })))
    }

    fn read(&self) -> RwLockReadGuard<'_, ControlNode> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ControlNode> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_id(self, local_id: impl Into<String>) -> Self {
        self.write().local_id = local_id.into();
        self
    }

    pub fn with_prop(self, key: impl Into<String>, value: impl Into<Prop>) -> Self {
        self.set_prop(key, value);
        self
    }

    pub fn with_child(self, child: Control) -> Self {
        self.write().children.push(child);
        self
    }

    pub fn with_children(self, children: impl IntoIterator<Item = Control>) -> Self {
        self.write().children.extend(children);
        self
    }

    /// Attach an event handler. `name` may carry an `on_` prefix.
    ///
    /// Also sets the `on_<name>` flag so the renderer forwards the event.
    pub fn on<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut Page, &Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.set_handler(name, Arc::new(handler));
        self
    }

    pub(crate) fn set_handler(&self, name: &str, handler: Handler) {
        let name = normalize_event_name(name);
        let mut node = self.write();
        node.props.insert(format!("on_{name}"), Prop::Value(Value::Bool(true)));
        node.handlers.insert(name.to_string(), handler);
    }

    pub fn kind(&self) -> String {
        self.read().kind.clone()
    }

    pub fn local_id(&self) -> String {
        self.read().local_id.clone()
    }

    pub fn wire_id(&self) -> Option<i64> {
        self.read().wire_id
    }

    /// Assign `id` unless the control already has one. Returns the effective id.
    pub(crate) fn assign_wire_id(&self, id: i64) -> i64 {
        *self.write().wire_id.get_or_insert(id)
    }

    pub fn prop(&self, key: &str) -> Option<Prop> {
        self.read().props.get(key).cloned()
    }

    /// Plain-data view of a property; `None` for missing or control-valued props.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.read().props.get(key).and_then(|p| p.as_value().cloned())
    }

    pub fn set_prop(&self, key: impl Into<String>, value: impl Into<Prop>) {
        self.write().props.insert(key.into(), value.into());
    }

    pub fn props(&self) -> BTreeMap<String, Prop> {
        self.read().props.clone()
    }

    pub fn children(&self) -> Vec<Control> {
        self.read().children.clone()
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.read().handlers.contains_key(normalize_event_name(name))
    }

    pub fn handler(&self, name: &str) -> Option<Handler> {
        self.read().handlers.get(normalize_event_name(name)).cloned()
    }

    /// Identity key: equal for clones of the same handle.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &Control) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Whether the control's `open` property is set to `true`.
    pub fn is_open(&self) -> bool {
        matches!(self.value("open"), Some(Value::Bool(true)))
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.read();
        f.debug_struct("Control")
            .field("kind", &node.kind)
            .field("local_id", &node.local_id)
            .field("wire_id", &node.wire_id)
            .finish_non_exhaustive()
    }
}

pub(crate) fn normalize_event_name(name: &str) -> &str {
    name.strip_prefix("on_").unwrap_or(name)
}
