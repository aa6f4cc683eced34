//! Input Matching
//!
//! Decides which combinations of a step's input data are complete enough to
//! start a task. Each input channel contributes its ready items; channels in
//! the same group are matched index by index (dot product) and groups are
//! combined as a cross product in ascending group order.
//!
//! Evaluation is pure: it reads the data store and returns input sets, so it
//! can be repeated freely whenever new data arrives.

use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::data::{
    Channel, DataContents, DataNodeError, DataPath, DataStore, DataType, InputMode, PathStep,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InputError {
    #[error("input dimensions do not match in group {group}: {detail}")]
    DimensionMismatch { group: u32, detail: String },

    #[error("step has no input channel named '{0}'")]
    UnknownChannel(String),

    #[error(transparent)]
    Data(#[from] DataNodeError),
}

/// The value one input channel hands to one task.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InputItem {
    pub channel: String,
    pub data_type: DataType,
    pub mode: InputMode,
    pub contents: DataContents,
}

/// Everything needed to create one task: where it sits in the scatter
/// space, and one item per input channel.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InputSet {
    pub data_path: DataPath,
    pub items: Vec<InputItem>,
}

impl InputSet {
    pub fn item(&self, channel: &str) -> Option<&InputItem> {
        self.items.iter().find(|item| item.channel == channel)
    }
}

/// Tree of pending input items keyed by data path.
#[derive(Debug, Default)]
struct GeneratorNode {
    degree: Option<usize>,
    children: BTreeMap<usize, GeneratorNode>,
    items: Vec<InputItem>,
}

impl GeneratorNode {
    fn is_empty(&self) -> bool {
        self.items.is_empty() && self.children.is_empty()
    }

    fn add_items(&mut self, path: &[PathStep], items: Vec<InputItem>) -> Result<(), String> {
        let Some((step, rest)) = path.split_first() else {
            self.items.extend(items);
            return Ok(());
        };

        match self.degree {
            None => self.degree = Some(step.degree),
            Some(degree) if degree != step.degree => {
                return Err(format!(
                    "array of length {} cannot be matched with length {}",
                    step.degree, degree
                ))
            }
            Some(_) => {}
        }

        self.children
            .entry(step.index)
            .or_default()
            .add_items(rest, items)
    }

    fn input_sets(&self, seed: &DataPath, out: &mut Vec<InputSet>) {
        match self.degree {
            None => {
                if !self.items.is_empty() {
                    out.push(InputSet {
                        data_path: seed.clone(),
                        items: self.items.clone(),
                    });
                }
            }
            Some(degree) => {
                for (index, child) in &self.children {
                    child.input_sets(&seed.child(*index, degree), out);
                }
            }
        }
    }

    fn all_input_sets(&self) -> Vec<InputSet> {
        let mut sets = Vec::new();
        self.input_sets(&DataPath::root(), &mut sets);
        sets
    }

    /// Node at `path`; a shallower leaf on the way answers for the whole
    /// subtree below it.
    fn get_node(&self, path: &DataPath) -> Result<Option<&GeneratorNode>, String> {
        let mut current = self;
        for step in path.steps() {
            let Some(degree) = current.degree else {
                return Ok(Some(current));
            };
            if degree != step.degree {
                return Err(format!(
                    "array of length {} cannot be matched with length {}",
                    step.degree, degree
                ));
            }
            match current.children.get(&step.index) {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn dot_product(&self, other: &GeneratorNode) -> Result<GeneratorNode, String> {
        let mut product = GeneratorNode::default();

        for set_a in self.all_input_sets() {
            let Some(node_b) = other.get_node(&set_a.data_path)? else {
                continue;
            };
            let mut sets_b = Vec::new();
            node_b.input_sets(&set_a.data_path, &mut sets_b);

            for set_b in sets_b {
                let mut items = set_a.items.clone();
                items.extend(set_b.items);
                product.add_items(set_b.data_path.steps(), items)?;
            }
        }

        Ok(product)
    }

    fn cross_product(&self, other: &GeneratorNode) -> Result<GeneratorNode, String> {
        let mut product = GeneratorNode::default();
        let sets_b = other.all_input_sets();

        for set_a in self.all_input_sets() {
            for set_b in &sets_b {
                let path = set_a.data_path.join(&set_b.data_path);
                let mut items = set_a.items.clone();
                items.extend(set_b.items.iter().cloned());
                product.add_items(path.steps(), items)?;
            }
        }

        Ok(product)
    }
}

/// Input matching for the input channels of one step.
pub struct InputManager<'a> {
    channels: &'a [Channel],
}

impl<'a> InputManager<'a> {
    pub fn new(channels: &'a [Channel]) -> Self {
        Self { channels }
    }

    /// Input sets made possible by data arriving at `data_path` on
    /// `trigger`.
    ///
    /// The triggering channel is only searched below `data_path` (minus its
    /// gathered dimensions); every other channel is searched in full. A step
    /// whose channels are not all ready yields no sets.
    pub fn get_ready_input_sets(
        &self,
        store: &DataStore,
        trigger: &str,
        data_path: &DataPath,
    ) -> Result<Vec<InputSet>, InputError> {
        if !self.channels.iter().any(|c| c.name == trigger) {
            return Err(InputError::UnknownChannel(trigger.to_string()));
        }

        self.compute(store, |channel| {
            if channel.name == trigger {
                data_path.truncated(channel.mode.gather_depth())
            } else {
                DataPath::root()
            }
        })
    }

    /// Every input set currently available, regardless of what triggered it.
    pub fn all_ready_input_sets(&self, store: &DataStore) -> Result<Vec<InputSet>, InputError> {
        self.compute(store, |_| DataPath::root())
    }

    fn compute<F>(&self, store: &DataStore, seed_for: F) -> Result<Vec<InputSet>, InputError>
    where
        F: Fn(&Channel) -> DataPath,
    {
        if self.channels.is_empty() {
            return Ok(vec![InputSet {
                data_path: DataPath::root(),
                items: Vec::new(),
            }]);
        }

        let mut groups: BTreeMap<u32, Vec<&Channel>> = BTreeMap::new();
        for channel in self.channels {
            groups.entry(channel.group).or_default().push(channel);
        }

        let mut combined: Option<GeneratorNode> = None;

        for (group, channels) in groups {
            let mut group_generator: Option<GeneratorNode> = None;

            for channel in channels {
                let generator = channel_generator(store, channel, &seed_for(channel))?;
                if generator.is_empty() {
                    debug!("Input '{}' has no ready data", channel.name);
                    return Ok(Vec::new());
                }

                group_generator = Some(match group_generator {
                    None => generator,
                    Some(existing) => existing
                        .dot_product(&generator)
                        .map_err(|detail| InputError::DimensionMismatch { group, detail })?,
                });
            }

            if let Some(group_generator) = group_generator {
                combined = Some(match combined {
                    None => group_generator,
                    Some(existing) => existing
                        .cross_product(&group_generator)
                        .map_err(|detail| InputError::DimensionMismatch { group, detail })?,
                });
            }
        }

        Ok(combined.map(|g| g.all_input_sets()).unwrap_or_default())
    }
}

fn channel_generator(
    store: &DataStore,
    channel: &Channel,
    seed: &DataPath,
) -> Result<GeneratorNode, InputError> {
    let mut generator = GeneratorNode::default();

    for (path, node) in channel.ready_items(store, seed) {
        let contents = if channel.mode.is_gathered() {
            DataContents::Array(store.flattened(node)?)
        } else {
            DataContents::Scalar(store.value(node)?)
        };

        let item = InputItem {
            channel: channel.name.clone(),
            data_type: channel.data_type,
            mode: channel.mode,
            contents,
        };

        generator
            .add_items(path.steps(), vec![item])
            .map_err(|detail| InputError::DimensionMismatch {
                group: channel.group,
                detail,
            })?;
    }

    Ok(generator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataValue;

    fn string(s: &str) -> DataValue {
        DataValue::String(s.to_string())
    }

    fn scatter(store: &mut DataStore, channel: &Channel, values: &[&str]) {
        for (i, v) in values.iter().enumerate() {
            channel
                .add_data_object(store, &DataPath::from_pairs(&[(i, values.len())]), string(v))
                .unwrap();
        }
    }

    fn channel(store: &mut DataStore, name: &str, group: u32, mode: InputMode) -> Channel {
        let root = store.create_root(DataType::String);
        Channel::new(name, DataType::String, root)
            .with_group(group)
            .with_mode(mode)
    }

    #[test]
    fn test_no_inputs_yields_one_root_set() {
        let store = DataStore::new();
        let sets = InputManager::new(&[]).all_ready_input_sets(&store).unwrap();

        assert_eq!(sets.len(), 1);
        assert!(sets[0].data_path.is_root());
        assert!(sets[0].items.is_empty());
    }

    #[test]
    fn test_not_ready_channel_blocks_everything() {
        let mut store = DataStore::new();
        let a = channel(&mut store, "a", 0, InputMode::NoGather);
        let b = channel(&mut store, "b", 1, InputMode::NoGather);
        let c = channel(&mut store, "c", 2, InputMode::Gather(1));
        scatter(&mut store, &a, &["a0", "a1"]);
        scatter(&mut store, &b, &["b0"]);
        c.add_data_object(&mut store, &DataPath::from_pairs(&[(0, 2)]), string("c0"))
            .unwrap();

        let channels = [a.clone(), b.clone(), c.clone()];
        let manager = InputManager::new(&channels);

        assert!(manager.all_ready_input_sets(&store).unwrap().is_empty());
        assert!(manager
            .get_ready_input_sets(&store, "a", &DataPath::from_pairs(&[(1, 2)]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unresolved_root_is_not_ready() {
        let mut store = DataStore::new();
        let a = channel(&mut store, "a", 0, InputMode::NoGather);
        let channels = [a];

        assert!(InputManager::new(&channels)
            .all_ready_input_sets(&store)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_dot_product_within_group() {
        let mut store = DataStore::new();
        let a = channel(&mut store, "a", 0, InputMode::NoGather);
        let b = channel(&mut store, "b", 0, InputMode::NoGather);
        scatter(&mut store, &a, &["a0", "a1", "a2"]);
        scatter(&mut store, &b, &["b0", "b1", "b2"]);

        let channels = [a, b];
        let sets = InputManager::new(&channels).all_ready_input_sets(&store).unwrap();

        assert_eq!(sets.len(), 3);
        for (i, set) in sets.iter().enumerate() {
            assert_eq!(set.data_path, DataPath::from_pairs(&[(i, 3)]));
            assert_eq!(
                set.item("a").unwrap().contents,
                DataContents::Scalar(string(&format!("a{}", i)))
            );
            assert_eq!(
                set.item("b").unwrap().contents,
                DataContents::Scalar(string(&format!("b{}", i)))
            );
        }
    }

    #[test]
    fn test_cross_product_across_groups() {
        let mut store = DataStore::new();
        let a = channel(&mut store, "a", 0, InputMode::NoGather);
        let b = channel(&mut store, "b", 1, InputMode::NoGather);
        scatter(&mut store, &a, &["a0", "a1"]);
        scatter(&mut store, &b, &["b0", "b1", "b2"]);

        // Declared out of group order on purpose.
        let channels = [b, a];
        let sets = InputManager::new(&channels).all_ready_input_sets(&store).unwrap();

        assert_eq!(sets.len(), 6);
        assert_eq!(sets[0].data_path, DataPath::from_pairs(&[(0, 2), (0, 3)]));
        assert_eq!(sets[5].data_path, DataPath::from_pairs(&[(1, 2), (2, 3)]));
        assert_eq!(sets[0].items[0].channel, "a");
        assert_eq!(sets[0].items[1].channel, "b");
    }

    #[test]
    fn test_scatter_with_gathered_group() {
        let mut store = DataStore::new();
        let a = channel(&mut store, "a", 0, InputMode::NoGather);
        let b = channel(&mut store, "b", 1, InputMode::Gather(1));
        scatter(&mut store, &a, &["a0", "a1"]);
        scatter(&mut store, &b, &["b0", "b1"]);

        let channels = [a, b];
        let sets = InputManager::new(&channels).all_ready_input_sets(&store).unwrap();

        assert_eq!(sets.len(), 2);
        for set in &sets {
            assert_eq!(
                set.item("b").unwrap().contents,
                DataContents::Array(vec![string("b0"), string("b1")])
            );
        }
        assert_eq!(sets[1].data_path, DataPath::from_pairs(&[(1, 2)]));
    }

    #[test]
    fn test_gathered_input_waits_for_whole_array() {
        let mut store = DataStore::new();
        let b = channel(&mut store, "b", 0, InputMode::Gather(1));
        let first = DataPath::from_pairs(&[(0, 2)]);
        b.add_data_object(&mut store, &first, string("b0")).unwrap();

        let channels = [b.clone()];
        let manager = InputManager::new(&channels);
        assert!(manager.get_ready_input_sets(&store, "b", &first).unwrap().is_empty());

        let second = DataPath::from_pairs(&[(1, 2)]);
        b.add_data_object(&mut store, &second, string("b1")).unwrap();
        let sets = manager.get_ready_input_sets(&store, "b", &second).unwrap();
        assert_eq!(sets.len(), 1);
        assert!(sets[0].data_path.is_root());
    }

    #[test]
    fn test_zero_length_scatter_yields_no_sets() {
        let mut store = DataStore::new();
        let a = channel(&mut store, "a", 0, InputMode::NoGather);
        store.ensure_branch(a.root, &DataPath::root(), 0).unwrap();

        let channels = [a.clone()];
        assert!(InputManager::new(&channels)
            .all_ready_input_sets(&store)
            .unwrap()
            .is_empty());

        let gathered = [a.with_mode(InputMode::Gather(1))];
        let sets = InputManager::new(&gathered).all_ready_input_sets(&store).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].items[0].contents, DataContents::Array(vec![]));
    }

    #[test]
    fn test_partial_arrival_yields_partial_sets() {
        let mut store = DataStore::new();
        let a = channel(&mut store, "a", 0, InputMode::NoGather);
        a.add_data_object(&mut store, &DataPath::from_pairs(&[(0, 3)]), string("a0"))
            .unwrap();
        a.add_data_object(&mut store, &DataPath::from_pairs(&[(2, 3)]), string("a2"))
            .unwrap();

        let channels = [a];
        let sets = InputManager::new(&channels).all_ready_input_sets(&store).unwrap();

        assert_eq!(sets.len(), 2);
        assert_eq!(sets[1].data_path.indices(), vec![2]);
    }

    #[test]
    fn test_dimension_mismatch_in_group() {
        let mut store = DataStore::new();
        let a = channel(&mut store, "a", 0, InputMode::NoGather);
        let b = channel(&mut store, "b", 0, InputMode::NoGather);
        scatter(&mut store, &a, &["a0", "a1"]);
        scatter(&mut store, &b, &["b0", "b1", "b2"]);

        let channels = [a, b];
        let err = InputManager::new(&channels).all_ready_input_sets(&store).unwrap_err();

        assert!(matches!(err, InputError::DimensionMismatch { group: 0, .. }));
    }

    #[test]
    fn test_trigger_restricts_to_new_data() {
        let mut store = DataStore::new();
        let a = channel(&mut store, "a", 0, InputMode::NoGather);
        scatter(&mut store, &a, &["a0", "a1", "a2"]);

        let channels = [a];
        let manager = InputManager::new(&channels);
        let sets = manager
            .get_ready_input_sets(&store, "a", &DataPath::from_pairs(&[(1, 3)]))
            .unwrap();

        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].items[0].contents, DataContents::Scalar(string("a1")));

        // Repeated evaluation is side-effect free.
        assert_eq!(
            manager
                .get_ready_input_sets(&store, "a", &DataPath::from_pairs(&[(1, 3)]))
                .unwrap(),
            sets
        );
    }

    #[test]
    fn test_unknown_trigger_channel() {
        let store = DataStore::new();
        let err = InputManager::new(&[])
            .get_ready_input_sets(&store, "ghost", &DataPath::root())
            .unwrap_err();

        assert_eq!(err, InputError::UnknownChannel("ghost".to_string()));
    }

    #[test]
    fn test_dot_product_with_deeper_channel() {
        let mut store = DataStore::new();
        let a = channel(&mut store, "a", 0, InputMode::NoGather);
        let b = channel(&mut store, "b", 0, InputMode::NoGather);
        let nested: serde_yaml::Value = serde_yaml::from_str("[[x, y], [z]]").unwrap();
        store.add_yaml(a.root, &DataPath::root(), &nested).unwrap();
        scatter(&mut store, &b, &["p", "q"]);

        let channels = [a, b];
        let sets = InputManager::new(&channels).all_ready_input_sets(&store).unwrap();

        assert_eq!(sets.len(), 3);
        assert_eq!(sets[1].data_path, DataPath::from_pairs(&[(0, 2), (1, 2)]));
        assert_eq!(sets[1].item("b").unwrap().contents, DataContents::Scalar(string("p")));
        assert_eq!(sets[2].item("b").unwrap().contents, DataContents::Scalar(string("q")));
    }
}
