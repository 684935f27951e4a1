//! Per-kind and per-key property normalization.
//!
//! Control kinds share one node type; anything that differs between kinds
//! lives in the small tables here instead of in per-kind types.

use crate::value::Value;

/// Irregular kind → wire class names. Everything else is CamelCased.
const CLASS_NAMES: &[(&str, &str)] = &[
    ("appbar", "AppBar"),
    ("app_bar", "AppBar"),
    ("alertdialog", "AlertDialog"),
    ("bottomsheet", "BottomSheet"),
    ("snackbar", "SnackBar"),
    ("textbutton", "TextButton"),
    ("elevatedbutton", "ElevatedButton"),
    ("filledbutton", "FilledButton"),
    ("iconbutton", "IconButton"),
    ("textfield", "TextField"),
    ("floatingactionbutton", "FloatingActionButton"),
    ("navigationbar", "NavigationBar"),
    ("cupertinobutton", "CupertinoButton"),
    ("cupertinoswitch", "CupertinoSwitch"),
    ("cupertinoslider", "CupertinoSlider"),
    ("cupertinotextfield", "CupertinoTextField"),
    ("cupertinoalertdialog", "CupertinoAlertDialog"),
];

/// Kinds whose legacy `text` property is sent as `content`.
const TEXT_AS_CONTENT: &[&str] = &[
    "button",
    "elevatedbutton",
    "elevated_button",
    "textbutton",
    "text_button",
    "filledbutton",
    "filled_button",
];

/// Kinds laid out by absolute coordinates.
const POSITIONED_KINDS: &[&str] = &["stack"];

/// Containers whose children may carry `expand`.
const EXPANDING_KINDS: &[&str] = &["view", "column", "row"];

/// Wire class name (`_c`) for a control kind.
pub fn class_name(kind: &str) -> String {
    if let Some((_, name)) = CLASS_NAMES.iter().find(|(k, _)| *k == kind) {
        return (*name).to_string();
    }
    kind.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

pub fn remaps_text_to_content(kind: &str) -> bool {
    TEXT_AS_CONTENT.contains(&kind)
}

pub fn is_positioned(kind: &str) -> bool {
    POSITIONED_KINDS.contains(&kind)
}

pub fn is_expanding(kind: &str) -> bool {
    EXPANDING_KINDS.contains(&kind)
}

/// Resolves icon names to codepoints. The name tables themselves live
/// outside the core; implementations plug them in here.
pub trait IconLookup: Send + Sync {
    fn codepoint_for(&self, name: &str) -> Option<i64>;
}

/// Lookup that only understands numeric spellings (`"0xe145"`, `"57669"`).
#[derive(Debug, Default, Clone, Copy)]
pub struct NumericIcons;

impl IconLookup for NumericIcons {
    fn codepoint_for(&self, name: &str) -> Option<i64> {
        parse_numeric(name.trim())
    }
}

fn parse_numeric(text: &str) -> Option<i64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse().ok();
    }
    None
}

fn is_icon_key(key: &str) -> bool {
    key == "icon" || key.ends_with("_icon")
}

fn is_color_key(key: &str) -> bool {
    key == "color" || key == "bgcolor" || key.ends_with("_color")
}

/// Lower a named color alias (`BLUE_GREY_400` → `bluegrey400`).
/// Hex colors and `color,opacity` pairs keep their spelling.
fn lower_color_alias(color: &str) -> String {
    if color.starts_with('#') || color.contains(',') {
        return color.to_string();
    }
    color
        .chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Normalize one property value for the wire.
pub fn normalize_value(icons: &dyn IconLookup, key: &str, value: Value) -> Value {
    match value {
        Value::Str(s) if is_icon_key(key) => icons
            .codepoint_for(&s)
            .map(Value::Int)
            .unwrap_or(Value::Str(s)),
        Value::Str(s) if is_color_key(key) => Value::Str(lower_color_alias(&s)),
        other => other,
    }
}
