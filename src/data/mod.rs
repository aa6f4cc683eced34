//! Channel Data Module
//!
//! The scatter/gather data trees that flow between steps.
//!
//! # Structure
//!
//! - [`path`]: `(index, degree)` addresses into nested arrays
//! - [`value`]: typed leaf values and input contents
//! - [`node`]: the node arena with readiness tracking
//! - [`channel`]: named bindings to data trees with gather mode and group

pub mod channel;
pub mod node;
pub mod path;
pub mod value;

pub use channel::{Channel, ChannelError, InputMode};
pub use node::{DataNodeError, DataStore, NodeId, SharedDataStore};
pub use path::{DataPath, PathStep};
pub use value::{DataContents, DataType, DataValue, ValueError};
