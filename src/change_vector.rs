//! Change vectors: per-document causal history.
//!
//! A change vector maps a node tag to the highest counter that node had
//! assigned when the version was written. Two versions are compared
//! component-wise; missing components count as zero.
//!
//! ```text
//! {A:3, B:1}  vs  {A:2, B:1}   → Newer       (every component ≥, one >)
//! {A:3, B:1}  vs  {A:3, B:1}   → Equal
//! {A:3}       vs  {B:1}        → Concurrent  (each has something the other lacks)
//! ```
//!
//! The textual form is `A:3, B:1`, sorted by node tag.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Causal relation of `self` to `other` as returned by [`ChangeVector::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Causality {
    /// Identical histories.
    Equal,
    /// `self` causally dominates `other`.
    Newer,
    /// `other` causally dominates `self`.
    Older,
    /// Neither dominates.
    Concurrent,
}

impl Causality {
    /// Whether `self` is equal to or dominated by `other`.
    pub fn is_covered(self) -> bool {
        matches!(self, Causality::Equal | Causality::Older)
    }
}

/// Node tag → counter map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeVector(BTreeMap<String, u64>);

impl ChangeVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vector with a single component.
    pub fn single(node: impl Into<String>, counter: u64) -> Self {
        let mut map = BTreeMap::new();
        map.insert(node.into(), counter);
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Counter for `node`, zero if absent.
    pub fn get(&self, node: &str) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    /// Set a component. Zero removes it so that equal histories compare equal.
    pub fn set(&mut self, node: impl Into<String>, counter: u64) {
        let node = node.into();
        if counter == 0 {
            self.0.remove(&node);
        } else {
            self.0.insert(node, counter);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Compare two vectors component-wise.
    pub fn compare(&self, other: &ChangeVector) -> Causality {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for node in self.0.keys().chain(other.0.keys()) {
            let mine = self.get(node);
            let theirs = other.get(node);
            if mine > theirs {
                self_ahead = true;
            } else if theirs > mine {
                other_ahead = true;
            }
            if self_ahead && other_ahead {
                return Causality::Concurrent;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Newer,
            (false, true) => Causality::Older,
            (true, true) => Causality::Concurrent,
        }
    }

    /// Component-wise maximum, in place.
    pub fn merge(&mut self, other: &ChangeVector) {
        for (node, counter) in &other.0 {
            let entry = self.0.entry(node.clone()).or_insert(0);
            if *counter > *entry {
                *entry = *counter;
            }
        }
    }

    /// Component-wise maximum of every vector in `vectors`.
    pub fn merged<'a>(vectors: impl IntoIterator<Item = &'a ChangeVector>) -> ChangeVector {
        let mut out = ChangeVector::new();
        for v in vectors {
            out.merge(v);
        }
        out
    }

    /// Raise the local component to `counter`, keeping it monotonic.
    ///
    /// The storage layer passes the freshly assigned etag, which is strictly
    /// greater than any counter this node has handed out before.
    pub fn advance(&mut self, node: &str, counter: u64) {
        let current = self.get(node);
        self.set(node.to_string(), current.max(counter));
    }
}

impl fmt::Display for ChangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (node, counter) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", node, counter)?;
            first = false;
        }
        Ok(())
    }
}

/// Error parsing the textual `A:3, B:1` form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid change vector component '{0}'")]
pub struct ParseChangeVectorError(pub String);

impl FromStr for ChangeVector {
    type Err = ParseChangeVectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut vector = ChangeVector::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (node, counter) = part
                .rsplit_once(':')
                .ok_or_else(|| ParseChangeVectorError(part.to_string()))?;
            let node = node.trim();
            if node.is_empty() {
                return Err(ParseChangeVectorError(part.to_string()));
            }
            let counter: u64 = counter
                .trim()
                .parse()
                .map_err(|_| ParseChangeVectorError(part.to_string()))?;
            vector.merge(&ChangeVector::single(node, counter));
        }
        // Zero components are dropped, same as `set`
        vector.0.retain(|_, c| *c > 0);
        Ok(vector)
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for ChangeVector {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        let mut vector = ChangeVector::new();
        for (node, counter) in iter {
            vector.set(node, counter);
        }
        vector
    }
}
