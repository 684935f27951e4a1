//! Per-connection page/session state.
//!
//! A [`Page`] owns the root control set, the page- and view-level property
//! bags, the dialog stack, the control registry, and the page-level event
//! handlers. Every mutation that the client must see is pushed to the
//! connection's outbox as a protocol [`Message`], in call order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::control::{Control, Handler, Prop, normalize_event_name};
use crate::error::{Result, RufletError};
use crate::event::Event;
use crate::props::{self, IconLookup, NumericIcons};
use crate::protocol::{Message, Patch};
use crate::registry::{ControlRegistry, DIALOGS_ID, OVERLAY_ID, PAGE_ID, Target, VIEW_ID};
use crate::value::{Value, ValueMap};
use crate::value_map;

/// Keys stored on the page rather than on the view.
const PAGE_PROP_KEYS: &[&str] = &["route", "title", "vertical_alignment", "horizontal_alignment"];

/// Keys mirrored into both property maps.
const ALIGNMENT_KEYS: &[&str] = &["vertical_alignment", "horizontal_alignment"];

/// Outgoing half of a connection, as seen by the page.
pub type Outbox = mpsc::UnboundedSender<Message>;

/// Optional page-level slots accepted by [`Page::add_with`].
#[derive(Debug, Default, Clone)]
pub struct Slots {
    pub appbar: Option<Control>,
    pub floating_action_button: Option<Control>,
    pub navigation_bar: Option<Control>,
    pub dialog: Option<Control>,
    pub snack_bar: Option<Control>,
    pub bottom_sheet: Option<Control>,
}

impl Slots {
    fn into_entries(self) -> impl Iterator<Item = (&'static str, Control)> {
        [
            ("appbar", self.appbar),
            ("floating_action_button", self.floating_action_button),
            ("navigation_bar", self.navigation_bar),
            ("dialog", self.dialog),
            ("snack_bar", self.snack_bar),
            ("bottom_sheet", self.bottom_sheet),
        ]
        .into_iter()
        .filter_map(|(key, control)| control.map(|c| (key, c)))
    }
}

pub struct Page {
    session_id: String,
    client_details: Value,
    outbox: Outbox,
    icons: Arc<dyn IconLookup>,
    registry: ControlRegistry,
    root_controls: Vec<Control>,
    views: Vec<Control>,
    overlay: Vec<Control>,
    dialogs: Vec<Control>,
    view_props: BTreeMap<String, Prop>,
    page_props: ValueMap,
    page_handlers: HashMap<String, Handler>,
}

impl Page {
    pub fn new(session_id: impl Into<String>, client_details: Value, outbox: Outbox) -> Self {
        let route = client_details
            .get("route")
            .and_then(Value::as_str)
            .unwrap_or("/")
            .to_string();
        let mut page_props = ValueMap::new();
        page_props.insert("route".into(), Value::from(route));

        Self {
            session_id: session_id.into(),
            client_details,
            outbox,
            icons: Arc::new(NumericIcons),
            registry: ControlRegistry::new(),
            root_controls: Vec::new(),
            views: Vec::new(),
            overlay: Vec::new(),
            dialogs: Vec::new(),
            view_props: BTreeMap::new(),
            page_props,
            page_handlers: HashMap::new(),
        }
    }

    /// Replace the icon name resolver used for `icon`/`*_icon` properties.
    pub fn with_icons(mut self, icons: Arc<dyn IconLookup>) -> Self {
        self.icons = icons;
        self
    }

    pub fn set_icons(&mut self, icons: Arc<dyn IconLookup>) {
        self.icons = icons;
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_details(&self) -> &Value {
        &self.client_details
    }

    pub fn registry(&self) -> &ControlRegistry {
        &self.registry
    }

    pub fn route(&self) -> Option<&str> {
        self.page_props.get("route").and_then(Value::as_str)
    }

    pub fn title(&self) -> Option<&str> {
        self.page_props.get("title").and_then(Value::as_str)
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.page_props.insert("title".into(), Value::from(title.into()));
    }

    pub fn page_prop(&self, key: &str) -> Option<&Value> {
        self.page_props.get(key)
    }

    pub fn view_prop(&self, key: &str) -> Option<&Prop> {
        self.view_props.get(key)
    }

    /// Controls currently tracked by the dialog stack, oldest first.
    pub fn dialogs(&self) -> &[Control] {
        &self.dialogs
    }

    /// Look up a registered control by wire id, name, or handle.
    pub fn control(&self, target: impl Into<Target>) -> Option<Control> {
        self.registry.resolve(&target.into())
    }

    fn resolve(&self, target: &Target) -> Result<Control> {
        self.registry
            .resolve(target)
            .ok_or_else(|| RufletError::TargetNotFound(format!("{target:?}")))
    }

    /// Merge properties into the page/view property maps without emitting.
    pub fn set_view_props<I, K, P>(&mut self, props: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: Into<Prop>,
    {
        let props = self.normalize_props(props);
        self.split_props(props);
        self
    }

    /// Install an explicit view stack, replacing the implicit root view.
    pub fn set_views(&mut self, views: Vec<Control>) -> &mut Self {
        self.views = views;
        self
    }

    /// Replace the root control set and push a full view patch.
    pub fn add(&mut self, roots: Vec<Control>) -> &mut Self {
        self.add_with(roots, Slots::default())
    }

    /// [`Page::add`] with app bar, navigation and side-channel slots.
    pub fn add_with(&mut self, roots: Vec<Control>, slots: Slots) -> &mut Self {
        let mut visited = HashSet::new();
        for root in &roots {
            self.registry.register_tree(root, &mut visited);
        }
        self.root_controls = roots;

        for (key, control) in slots.into_entries() {
            self.view_props.insert(key.to_string(), Prop::Control(control));
        }
        for prop in self.view_props.values() {
            self.registry.register_prop(prop, &mut visited);
        }

        self.send_view_patch();
        self
    }

    /// Show `control` in the overlay container.
    pub fn add_overlay(&mut self, control: Control) -> &mut Self {
        if !self.overlay.iter().any(|c| c.ptr_eq(&control)) {
            self.registry.register(std::slice::from_ref(&control));
            self.overlay.push(control);
        }
        let container = self.container_value("Overlay", OVERLAY_ID, &self.overlay);
        self.send(Patch::new(PAGE_ID).set("_overlay", container).into_message());
        self
    }

    /// Push the full view again.
    pub fn refresh(&mut self) -> &mut Self {
        self.send_view_patch();
        self
    }

    /// Update the page or one control.
    ///
    /// Page targets re-split the properties and push a full view patch.
    /// Control targets store the properties on the node and push one
    /// targeted patch. Unknown targets are ignored.
    pub fn update<T, I, K, P>(&mut self, target: T, props: I) -> &mut Self
    where
        T: Into<Target>,
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: Into<Prop>,
    {
        let target = target.into();
        let mut props = self.normalize_props(props);

        if target.is_page() {
            self.split_props(props);
            self.send_view_patch();
            return self;
        }

        let control = match self.resolve(&target) {
            Ok(control) => control,
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "Update ignored");
                return self;
            }
        };
        let Some(wire_id) = control.wire_id() else {
            return self;
        };

        if props::remaps_text_to_content(&control.kind()) {
            if let Some(pos) = props.iter().position(|(k, _)| k == "text") {
                props[pos].0 = "content".to_string();
            }
        }

        let mut visited = HashSet::new();
        let mut patch = Patch::new(wire_id);
        for (key, prop) in props {
            self.registry.register_prop(&prop, &mut visited);
            patch = patch.set(key.as_str(), ControlRegistry::serialize_prop(&prop));
            control.set_prop(key, prop);
        }

        self.send(patch.into_message());
        self
    }

    /// Navigate to `route`, appending percent-encoded query pairs.
    ///
    /// The route-change handler runs after the route is stored and before
    /// the view patch goes out.
    pub fn go(&mut self, route: &str, query: &[(&str, &str)]) -> anyhow::Result<&mut Self> {
        let route = build_route(route, query);
        self.page_props.insert("route".into(), Value::from(route.as_str()));
        self.dispatch_page_event("route_change", Value::from(route))?;
        self.send_view_patch();
        Ok(self)
    }

    /// Register a page-level handler. The `on_` prefix is optional.
    pub fn on<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(&mut Page, &Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.page_handlers
            .insert(normalize_event_name(name).to_string(), Arc::new(handler));
        self
    }

    pub fn on_route_change<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut Page, &Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on("route_change", handler)
    }

    pub fn on_view_pop<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut Page, &Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on("view_pop", handler)
    }

    /// Attach a handler to a control; a registered control also gets its
    /// `on_<name>` flag patched on the client.
    pub fn on_control<F>(&mut self, control: &Control, name: &str, handler: F) -> &mut Self
    where
        F: Fn(&mut Page, &Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        control.set_handler(name, Arc::new(handler));
        if let Some(wire_id) = control.wire_id() {
            let flag = format!("on_{}", normalize_event_name(name));
            self.send(Patch::new(wire_id).set(flag, true).into_message());
        }
        self
    }

    /// Open a dialog-like control and track it. Showing a control that is
    /// already tracked and open does nothing.
    pub fn show_dialog(&mut self, control: &Control) -> &mut Self {
        let tracked = self.dialogs.iter().any(|c| c.ptr_eq(control));
        if tracked && control.is_open() {
            return self;
        }

        control.set_prop("open", true);
        if !tracked {
            self.registry.register(std::slice::from_ref(control));
            self.dialogs.push(control.clone());
        }
        self.send_dialogs_patch();
        self
    }

    /// Close the most recently tracked dialog that is still open.
    ///
    /// Entries already closed (e.g. through `update(dialog, open: false)`)
    /// are skipped, so this is LIFO over the open subset only.
    pub fn pop_dialog(&mut self) -> Option<Control> {
        let control = self.dialogs.iter().rev().find(|c| c.is_open())?.clone();
        control.set_prop("open", false);
        self.send_dialogs_patch();
        Some(control)
    }

    /// Route a client event to the page or to a control handler.
    ///
    /// Unknown targets and controls without a handler for `name` are
    /// ignored. Handler errors are returned to the caller.
    pub fn dispatch_event(&mut self, target: &Value, name: &str, data: Value) -> anyhow::Result<()> {
        let resolved = Target::from(target);
        if resolved.is_page() {
            if name == "route_change" {
                if let Some(route) = extract_route(&data) {
                    self.page_props.insert("route".into(), Value::from(route));
                }
            }
            return self.dispatch_page_event(name, data);
        }

        let control = match self.resolve(&resolved) {
            Ok(control) => control,
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, name, "Event ignored");
                return Ok(());
            }
        };

        if normalize_event_name(name) == "dismiss" {
            if let Some(pos) = self.dialogs.iter().position(|c| c.ptr_eq(&control)) {
                let dismissed = self.dialogs.remove(pos);
                dismissed.set_prop("open", false);
                self.send_dialogs_patch();
            }
        }

        let Some(handler) = control.handler(name) else {
            debug!(session_id = %self.session_id, %target, name, "No handler attached");
            return Ok(());
        };
        let event = Event::new(name, target.clone(), data, Some(control));
        handler(self, &event)
    }

    /// Store properties echoed by the client without pushing anything back.
    pub fn apply_client_update(&mut self, target: &Value, props: ValueMap) {
        let control = match self.resolve(&Target::from(target)) {
            Ok(control) => control,
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "Client update ignored");
                return;
            }
        };
        for (key, value) in props {
            control.set_prop(key, value);
        }
    }

    fn dispatch_page_event(&mut self, name: &str, data: Value) -> anyhow::Result<()> {
        let Some(handler) = self.page_handlers.get(normalize_event_name(name)).cloned() else {
            return Ok(());
        };
        let event = Event::new(name, Value::Int(PAGE_ID), data, None);
        handler(self, &event)
    }

    fn normalize_props<I, K, P>(&self, props: I) -> Vec<(String, Prop)>
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: Into<Prop>,
    {
        props
            .into_iter()
            .map(|(k, p)| {
                let key = k.into();
                let prop = match p.into() {
                    Prop::Value(v) => Prop::Value(props::normalize_value(self.icons.as_ref(), &key, v)),
                    other => other,
                };
                (key, prop)
            })
            .collect()
    }

    fn split_props(&mut self, props: Vec<(String, Prop)>) {
        for (key, prop) in props {
            let key_str = key.as_str();
            if ALIGNMENT_KEYS.contains(&key_str) {
                self.page_props
                    .insert(key.clone(), ControlRegistry::serialize_prop(&prop));
                self.view_props.insert(key, prop);
            } else if PAGE_PROP_KEYS.contains(&key_str) {
                self.page_props.insert(key, ControlRegistry::serialize_prop(&prop));
            } else {
                self.view_props.insert(key, prop);
            }
        }
    }

    fn send(&self, message: Message) {
        if self.outbox.send(message).is_err() {
            debug!(session_id = %self.session_id, "Outbox closed, dropping message");
        }
    }

    fn send_view_patch(&mut self) {
        self.refresh_indexes();

        let views: Vec<Value> = if self.views.is_empty() {
            vec![self.implicit_view()]
        } else {
            self.views.iter().map(ControlRegistry::serialize).collect()
        };
        self.send(Patch::new(PAGE_ID).set("views", views).into_message());

        if !self.page_props.is_empty() {
            let mut patch = Patch::new(PAGE_ID);
            for (key, value) in &self.page_props {
                patch = patch.set(key.as_str(), value.clone());
            }
            self.send(patch.into_message());
        }
    }

    fn send_dialogs_patch(&self) {
        let container = self.container_value("Dialogs", DIALOGS_ID, &self.dialogs);
        self.send(Patch::new(PAGE_ID).set("_dialogs", container).into_message());
    }

    fn container_value(&self, class: &str, id: i64, controls: &[Control]) -> Value {
        let controls: Vec<Value> = controls.iter().map(ControlRegistry::serialize).collect();
        value_map! {"_c" => class, "_i" => id, "controls" => controls}
    }

    fn refresh_indexes(&mut self) {
        let roots: Vec<Control> = if self.views.is_empty() {
            self.root_controls
                .iter()
                .chain(&self.dialogs)
                .chain(&self.overlay)
                .cloned()
                .collect()
        } else {
            self.views
                .iter()
                .chain(&self.dialogs)
                .chain(&self.overlay)
                .cloned()
                .collect()
        };
        let embedded: Vec<Prop> = if self.views.is_empty() {
            self.view_props.values().cloned().collect()
        } else {
            Vec::new()
        };
        self.registry.refresh(&roots, &embedded);
    }

    fn implicit_view(&self) -> Value {
        let route = self
            .route()
            .or_else(|| self.client_details.get("route").and_then(Value::as_str))
            .unwrap_or("/");

        let mut view = ValueMap::new();
        view.insert("_c".into(), Value::from("View"));
        view.insert("_i".into(), Value::Int(VIEW_ID));
        view.insert("route".into(), Value::from(route));
        view.insert("_internals".into(), value_map! {"host_expanded" => true});
        for (key, prop) in &self.view_props {
            view.insert(key.clone(), ControlRegistry::serialize_prop(prop));
        }
        let controls: Vec<Value> = self.root_controls.iter().map(ControlRegistry::serialize).collect();
        view.insert("controls".into(), Value::List(controls));
        Value::Map(view)
    }
}

fn build_route(route: &str, query: &[(&str, &str)]) -> String {
    if query.is_empty() {
        return route.to_string();
    }
    let encoded = query
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if route.contains('?') { '&' } else { '?' };
    format!("{route}{separator}{encoded}")
}

fn extract_route(data: &Value) -> Option<String> {
    match data {
        Value::Str(s) => Some(s.clone()),
        Value::Map(m) => m.get("route").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}
