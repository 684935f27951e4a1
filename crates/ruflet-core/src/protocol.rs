//! Ruflet session protocol.
//!
//! Every message in either direction is a two-element list
//! `[action_code, payload]`, encoded with [`crate::codec`] and carried in one
//! binary WebSocket frame.

use crate::codec;
use crate::error::{Result, RufletError};
use crate::value::{Value, ValueMap};
use crate::value_map;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    RegisterClient,
    PatchControl,
    ControlEvent,
    UpdateControl,
    InvokeControlMethod,
    SessionCrashed,
}

impl Action {
    pub fn code(self) -> i64 {
        match self {
            Action::RegisterClient => 1,
            Action::PatchControl => 2,
            Action::ControlEvent => 3,
            Action::UpdateControl => 4,
            Action::InvokeControlMethod => 5,
            Action::SessionCrashed => 6,
        }
    }

    /// Parse an action code, accepting the string aliases of the older
    /// JSON-era web client.
    pub fn from_wire(raw: &Value) -> Result<Self> {
        let action = match raw {
            Value::Str(s) => match s.as_str() {
                "registerWebClient" => Some(Action::RegisterClient),
                "pageEventFromWeb" => Some(Action::ControlEvent),
                "updateControlProps" => Some(Action::UpdateControl),
                _ => None,
            },
            other => match other.as_i64() {
                Some(1) => Some(Action::RegisterClient),
                Some(2) => Some(Action::PatchControl),
                Some(3) => Some(Action::ControlEvent),
                Some(4) => Some(Action::UpdateControl),
                Some(5) => Some(Action::InvokeControlMethod),
                Some(6) => Some(Action::SessionCrashed),
                _ => None,
            },
        };
        action.ok_or_else(|| RufletError::UnknownAction(format!("{raw:?}")))
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub action: Action,
    pub payload: Value,
}

impl Message {
    pub fn new(action: Action, payload: Value) -> Self {
        Self { action, payload }
    }

    pub fn to_value(&self) -> Value {
        Value::List(vec![Value::Int(self.action.code()), self.payload.clone()])
    }

    pub fn encode(&self) -> Vec<u8> {
        codec::encode(&self.to_value())
    }

    /// Decode an incoming message.
    ///
    /// Besides `[action, payload]`, a map with `action`/`payload` keys is
    /// accepted, as is a bare map with `target` and `name`, which is read as
    /// a control event.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (action, payload) = split_envelope(codec::decode(bytes)?)?;
        Ok(Self {
            action: Action::from_wire(&action)?,
            payload: if payload.is_nil() { Value::map() } else { payload },
        })
    }
}

fn split_envelope(value: Value) -> Result<(Value, Value)> {
    match value {
        Value::List(items) if items.len() >= 2 => {
            let mut items = items.into_iter();
            let action = items.next().unwrap_or_default();
            let payload = items.next().unwrap_or_default();
            Ok((action, payload))
        }
        Value::Map(mut map) => {
            if let Some(action) = map.remove("action").filter(|a| !a.is_nil()) {
                let payload = map.remove("payload").unwrap_or_default();
                return Ok((action, payload));
            }
            if map.contains_key("target") && map.contains_key("name") {
                return Ok((Value::Int(Action::ControlEvent.code()), Value::Map(map)));
            }
            Err(RufletError::Protocol("Unsupported payload format".into()))
        }
        _ => Err(RufletError::Protocol("Unsupported payload format".into())),
    }
}

/// Client registration, flattened from `{session_id, page_name, page: {...}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterRequest {
    pub session_id: Option<String>,
    pub page_name: String,
    pub route: String,
    pub width: Value,
    pub height: Value,
    pub platform: Value,
    pub platform_brightness: Value,
    pub media: Value,
}

impl RegisterRequest {
    pub fn from_payload(payload: &Value) -> Self {
        let page = payload.get("page").cloned().unwrap_or_default();
        let field = |key: &str| page.get(key).cloned().unwrap_or_default();
        Self {
            session_id: payload
                .get("session_id")
                .filter(|v| !v.is_nil())
                .map(Value::to_key_string)
                .filter(|s| !s.is_empty()),
            page_name: payload
                .get("page_name")
                .map(Value::to_key_string)
                .unwrap_or_default(),
            route: page
                .get("route")
                .and_then(Value::as_str)
                .unwrap_or("/")
                .to_string(),
            width: field("width"),
            height: field("height"),
            platform: field("platform"),
            platform_brightness: field("platform_brightness"),
            media: page.get("media").cloned().unwrap_or_else(Value::map),
        }
    }

    /// Client details as handed to the page.
    pub fn details(&self) -> Value {
        value_map! {
            "session_id" => self.session_id.clone(),
            "page_name" => self.page_name.clone(),
            "route" => self.route.clone(),
            "width" => self.width.clone(),
            "height" => self.height.clone(),
            "platform" => self.platform.clone(),
            "platform_brightness" => self.platform_brightness.clone(),
            "media" => self.media.clone(),
        }
    }
}

/// A user interaction reported by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlEvent {
    pub target: Value,
    pub name: String,
    pub data: Value,
}

impl ControlEvent {
    /// `None` when the target or the event name is missing.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let pick = |key: &str, legacy: &str| {
            payload
                .get(key)
                .or_else(|| payload.get(legacy))
                .cloned()
                .unwrap_or_default()
        };
        let target = pick("target", "eventTarget");
        let name = pick("name", "eventName").to_key_string();
        if target.is_nil() || name.is_empty() {
            return None;
        }
        Some(Self {
            target,
            name,
            data: pick("data", "eventData"),
        })
    }
}

/// Optimistic property echo from the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlUpdate {
    pub id: Value,
    pub props: ValueMap,
}

impl ControlUpdate {
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let id = payload.get("id").filter(|v| !v.is_nil())?.clone();
        let props = payload.get("props").and_then(Value::as_map).cloned().unwrap_or_default();
        Some(Self { id, props })
    }
}

/// A targeted set of property assignments for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub target: i64,
    pub ops: Vec<(String, Value)>,
}

impl Patch {
    pub fn new(target: i64) -> Self {
        Self { target, ops: Vec::new() }
    }

    pub fn set(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push((property.into(), value.into()));
        self
    }

    /// `{id, patch: [[0], [0, 0, name, value], ...]}`; path `[0]` is the node itself.
    pub fn to_payload(&self) -> Value {
        let mut patch = Vec::with_capacity(self.ops.len() + 1);
        patch.push(Value::List(vec![Value::Int(0)]));
        for (name, value) in &self.ops {
            patch.push(Value::List(vec![
                Value::Int(0),
                Value::Int(0),
                Value::from(name.as_str()),
                value.clone(),
            ]));
        }
        value_map! {"id" => self.target, "patch" => Value::List(patch)}
    }

    pub fn into_message(self) -> Message {
        Message::new(Action::PatchControl, self.to_payload())
    }
}

pub fn register_response(session_id: &str) -> Message {
    Message::new(
        Action::RegisterClient,
        value_map! {"session_id" => session_id, "page_patch" => Value::map(), "error" => Value::Nil},
    )
}

pub fn session_crashed(message: &str) -> Message {
    Message::new(Action::SessionCrashed, value_map! {"message" => message})
}
