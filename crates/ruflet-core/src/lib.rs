//! Core types for Ruflet: the binary wire codec, the control tree model,
//! the per-session control registry, and page/session state.

pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod page;
pub mod props;
pub mod protocol;
pub mod registry;
pub mod value;

pub use control::Control;
pub use error::{Result, RufletError};
pub use event::Event;
pub use page::{Outbox, Page, Slots};
pub use value::Value;
