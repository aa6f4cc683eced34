//! Channels
//!
//! A channel binds a named, typed step port to the root of a data tree.
//! Input channels also carry the scatter group and gather mode used when
//! matching inputs. Connected channels share one root instead of copying.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::node::{DataNodeError, DataStore, NodeId};
use super::path::DataPath;
use super::value::{DataType, DataValue};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChannelError {
    #[error("invalid input mode '{0}' (expected no_gather, gather or gather(n))")]
    InvalidMode(String),
}

/// How an input consumes array data.
///
/// `NoGather` scatters over every element; `Gather(n)` collapses the `n`
/// innermost dimensions into one array-valued input.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(try_from = "String", into = "String")]
pub enum InputMode {
    #[default]
    NoGather,
    Gather(usize),
}

impl InputMode {
    /// Number of innermost dimensions folded into one item.
    pub fn gather_depth(&self) -> usize {
        match self {
            Self::NoGather => 0,
            Self::Gather(depth) => *depth,
        }
    }

    pub fn is_gathered(&self) -> bool {
        self.gather_depth() > 0
    }
}

impl FromStr for InputMode {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "no_gather" => return Ok(Self::NoGather),
            "gather" => return Ok(Self::Gather(1)),
            _ => {}
        }

        trimmed
            .strip_prefix("gather(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|depth| depth.trim().parse::<usize>().ok())
            .map(|depth| if depth == 0 { Self::NoGather } else { Self::Gather(depth) })
            .ok_or_else(|| ChannelError::InvalidMode(s.to_string()))
    }
}

impl TryFrom<String> for InputMode {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InputMode> for String {
    fn from(mode: InputMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoGather => write!(f, "no_gather"),
            Self::Gather(1) => write!(f, "gather"),
            Self::Gather(depth) => write!(f, "gather({})", depth),
        }
    }
}

/// A named binding to a data tree.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: String,
    pub data_type: DataType,
    pub group: u32,
    pub mode: InputMode,
    pub root: NodeId,
}

impl Channel {
    pub fn new(name: impl Into<String>, data_type: DataType, root: NodeId) -> Self {
        Self {
            name: name.into(),
            data_type,
            group: 0,
            mode: InputMode::NoGather,
            root,
        }
    }

    /// Sets the scatter group.
    pub fn with_group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    /// Sets the gather mode.
    pub fn with_mode(mut self, mode: InputMode) -> Self {
        self.mode = mode;
        self
    }

    /// A channel under another name reading and writing the same data.
    pub fn connect(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn is_connected_to(&self, other: &Channel) -> bool {
        self.root == other.root
    }

    pub fn is_ready(&self, store: &DataStore, path: &DataPath) -> bool {
        store.is_ready(self.root, path)
    }

    /// Ready items under `seed` according to this channel's gather mode.
    pub fn ready_items(&self, store: &DataStore, seed: &DataPath) -> Vec<(DataPath, NodeId)> {
        store.ready_items(self.root, seed, self.mode.gather_depth())
    }

    pub fn add_data_object(
        &self,
        store: &mut DataStore,
        path: &DataPath,
        value: DataValue,
    ) -> Result<NodeId, DataNodeError> {
        store.add_data_object(self.root, path, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        assert_eq!("no_gather".parse::<InputMode>().unwrap(), InputMode::NoGather);
        assert_eq!("gather".parse::<InputMode>().unwrap(), InputMode::Gather(1));
        assert_eq!("gather(3)".parse::<InputMode>().unwrap(), InputMode::Gather(3));
        assert_eq!(" gather( 2 ) ".parse::<InputMode>().unwrap(), InputMode::Gather(2));
        assert_eq!("gather(0)".parse::<InputMode>().unwrap(), InputMode::NoGather);
    }

    #[test]
    fn test_parse_invalid_mode() {
        assert!("scatter".parse::<InputMode>().is_err());
        assert!("gather(x)".parse::<InputMode>().is_err());
        assert!("gather(2".parse::<InputMode>().is_err());
    }

    #[test]
    fn test_mode_display_round_trips() {
        for mode in [InputMode::NoGather, InputMode::Gather(1), InputMode::Gather(4)] {
            assert_eq!(mode.to_string().parse::<InputMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_mode_deserializes_from_yaml() {
        let mode: InputMode = serde_yaml::from_str("gather(2)").unwrap();
        assert_eq!(mode.gather_depth(), 2);
        assert!(mode.is_gathered());
        assert!(serde_yaml::from_str::<InputMode>("sideways").is_err());
    }

    #[test]
    fn test_connected_channels_share_data() {
        let mut store = DataStore::new();
        let root = store.create_root(DataType::String);
        let output = Channel::new("greeting", DataType::String, root);
        let input = output.connect("message").with_group(1);

        output
            .add_data_object(&mut store, &DataPath::root(), DataValue::String("hi".into()))
            .unwrap();

        assert!(input.is_connected_to(&output));
        assert!(input.is_ready(&store, &DataPath::root()));
        assert_eq!(input.ready_items(&store, &DataPath::root()).len(), 1);
        assert_eq!(input.group, 1);
    }
}
