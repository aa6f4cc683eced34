//! Data Paths
//!
//! A [`DataPath`] addresses one position inside nested array data as an
//! ordered list of `(index, degree)` steps. The empty path addresses the
//! root of a channel's data tree.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step down a nested array: element `index` of an array of `degree`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathStep {
    pub index: usize,
    pub degree: usize,
}

impl PathStep {
    pub fn new(index: usize, degree: usize) -> Self {
        Self { index, degree }
    }
}

/// Ordered sequence of [`PathStep`]s from the root of a data tree.
///
/// # Example
///
/// ```
/// use scatterflow::data::DataPath;
///
/// let path = DataPath::from_pairs(&[(1, 2), (0, 3)]);
/// assert_eq!(path.to_string(), "[(1,2),(0,3)]");
/// assert_eq!(path.truncated(1), DataPath::from_pairs(&[(1, 2)]));
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DataPath(Vec<PathStep>);

impl DataPath {
    /// The empty path, addressing the root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Builds a path from `(index, degree)` pairs.
    pub fn from_pairs(pairs: &[(usize, usize)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|&(index, degree)| PathStep::new(index, degree))
                .collect(),
        )
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new path one level deeper.
    pub fn child(&self, index: usize, degree: usize) -> Self {
        let mut steps = self.0.clone();
        steps.push(PathStep::new(index, degree));
        Self(steps)
    }

    /// Drops the last `depth` steps. Truncating past the root yields the root.
    pub fn truncated(&self, depth: usize) -> Self {
        let keep = self.0.len().saturating_sub(depth);
        Self(self.0[..keep].to_vec())
    }

    /// Keeps only the first `len` steps.
    pub fn prefix(&self, len: usize) -> Self {
        Self(self.0[..len.min(self.0.len())].to_vec())
    }

    /// Concatenates two paths.
    pub fn join(&self, other: &DataPath) -> Self {
        let mut steps = self.0.clone();
        steps.extend_from_slice(&other.0);
        Self(steps)
    }

    pub fn starts_with(&self, prefix: &DataPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// The indices of every step, outermost first.
    pub fn indices(&self) -> Vec<usize> {
        self.0.iter().map(|s| s.index).collect()
    }

    /// The degrees of every step, outermost first.
    pub fn degrees(&self) -> Vec<usize> {
        self.0.iter().map(|s| s.degree).collect()
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "({},{})", step.index, step.degree)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_path() {
        let root = DataPath::root();
        assert!(root.is_root());
        assert_eq!(root.len(), 0);
        assert_eq!(root.to_string(), "[]");
    }

    #[test]
    fn test_child_extends_path() {
        let path = DataPath::root().child(1, 3).child(0, 2);
        assert_eq!(path, DataPath::from_pairs(&[(1, 3), (0, 2)]));
        assert_eq!(path.indices(), vec![1, 0]);
        assert_eq!(path.degrees(), vec![3, 2]);
    }

    #[test]
    fn test_truncated_saturates() {
        let path = DataPath::from_pairs(&[(0, 2), (1, 2)]);
        assert_eq!(path.truncated(0), path);
        assert_eq!(path.truncated(1), DataPath::from_pairs(&[(0, 2)]));
        assert_eq!(path.truncated(5), DataPath::root());
    }

    #[test]
    fn test_join_and_prefix() {
        let a = DataPath::from_pairs(&[(0, 2)]);
        let b = DataPath::from_pairs(&[(2, 3)]);
        let joined = a.join(&b);

        assert_eq!(joined.to_string(), "[(0,2),(2,3)]");
        assert!(joined.starts_with(&a));
        assert!(!joined.starts_with(&b));
        assert_eq!(joined.prefix(1), a);
        assert_eq!(joined.prefix(10), joined);
    }

    #[test]
    fn test_ordering_follows_indices() {
        let mut paths = vec![
            DataPath::from_pairs(&[(2, 3)]),
            DataPath::from_pairs(&[(0, 3)]),
            DataPath::from_pairs(&[(1, 3)]),
        ];
        paths.sort();
        assert_eq!(paths[0].indices(), vec![0]);
        assert_eq!(paths[2].indices(), vec![2]);
    }

    #[test]
    fn test_serialization_is_a_list_of_pairs() {
        let path = DataPath::from_pairs(&[(1, 2)]);
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, r#"[{"index":1,"degree":2}]"#);
    }
}
