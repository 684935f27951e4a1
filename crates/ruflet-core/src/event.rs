//! Event value handed to control and page handlers.

use crate::control::Control;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    /// Wire id or name the client addressed the event to.
    pub target: Value,
    /// Payload exactly as received.
    pub raw_data: Value,
    /// `raw_data` parsed as JSON when it is a JSON string, otherwise `raw_data`.
    pub data: Value,
    /// The control the event was routed to; `None` for page events.
    pub control: Option<Control>,
}

impl Event {
    pub fn new(name: impl Into<String>, target: Value, raw_data: Value, control: Option<Control>) -> Self {
        let data = parse_data(&raw_data);
        Self {
            name: name.into(),
            target,
            raw_data,
            data,
            control,
        }
    }
}

fn parse_data(raw: &Value) -> Value {
    match raw {
        Value::Str(s) => serde_json::from_str::<serde_json::Value>(s)
            .map(Value::from)
            .unwrap_or_else(|_| raw.clone()),
        other => other.clone(),
    }
}
