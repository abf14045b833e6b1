use std::fmt::Display;
use std::hash::Hasher;

use thiserror::Error;
use twox_hash::XxHash64;

/// The reserved label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Separator fed to the hasher between label components, a byte that can
/// not occur in valid UTF-8 label names or values.
const HASH_SEPARATOR: [u8; 1] = [0xff];

/// Errors constructing a [`Labels`] set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelsError {
    /// Two labels share the same name.
    #[error("duplicate label name {0:?}")]
    DuplicateName(String),
}

/// A single (name, value) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    /// The label name.
    pub name: String,
    /// The label value.
    pub value: String,
}

impl Label {
    /// Create a new label pair.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered label set, sorted by label name.
///
/// The sort invariant is maintained by construction; duplicate names are
/// rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a label set from unordered pairs, sorting by name.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Result<Self, LabelsError>
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<_> = pairs
            .into_iter()
            .map(|(name, value)| Label::new(name, value))
            .collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));

        if let Some(pair) = labels.windows(2).find(|pair| pair[0].name == pair[1].name) {
            return Err(LabelsError::DuplicateName(pair[0].name.clone()));
        }

        Ok(Self(labels))
    }

    /// The number of labels in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the labels in name order.
    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    /// Returns the value of the label with `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    /// The metric name (`__name__` label), if present.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    /// Returns a copy with the label `name` removed.
    ///
    /// Returns `self` unchanged (cheaply) when the label is absent.
    pub fn without_label(&self, name: &str) -> Self {
        if self.get(name).is_none() {
            return self.clone();
        }
        Self(self.0.iter().filter(|l| l.name != name).cloned().collect())
    }

    /// The canonical form: labels with empty values stripped.
    ///
    /// Sharding and fingerprinting both operate on this form.
    pub fn canonical(&self) -> Self {
        if self.0.iter().all(|l| !l.value.is_empty()) {
            return self.clone();
        }
        Self(
            self.0
                .iter()
                .filter(|l| !l.value.is_empty())
                .cloned()
                .collect(),
        )
    }

    /// A stable 64-bit fingerprint of the canonical label set.
    ///
    /// Depends only on the bytes of the canonical labels, so it is stable
    /// across processes and over restarts.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        for label in &self.0 {
            if label.value.is_empty() {
                continue;
            }
            hasher.write(label.name.as_bytes());
            hasher.write(&HASH_SEPARATOR);
            hasher.write(label.value.as_bytes());
            hasher.write(&HASH_SEPARATOR);
        }
        hasher.finish()
    }
}

impl Display for Labels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl IntoIterator for Labels {
    type Item = Label;
    type IntoIter = std::vec::IntoIter<Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_sorting_and_lookup() {
        let labels = Labels::from_pairs([("job", "api"), ("__name__", "up"), ("zone", "a")]).unwrap();
        let names: Vec<_> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["__name__", "job", "zone"]);
        assert_eq!(labels.get("job"), Some("api"));
        assert_eq!(labels.get("missing"), None);
        assert_eq!(labels.metric_name(), Some("up"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        assert_matches!(
            Labels::from_pairs([("a", "1"), ("a", "2")]),
            Err(LabelsError::DuplicateName(name)) if name == "a"
        );
    }

    #[test]
    fn test_fingerprint_ignores_input_order() {
        let a = Labels::from_pairs([("job", "api"), ("zone", "a")]).unwrap();
        let b = Labels::from_pairs([("zone", "a"), ("job", "api")]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_strips_empty_values() {
        let a = Labels::from_pairs([("job", "api"), ("zone", "")]).unwrap();
        let b = Labels::from_pairs([("job", "api")]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.canonical(), b);
    }

    #[test]
    fn test_fingerprint_is_not_concat_confusable() {
        // ("ab", "c") must not collide with ("a", "bc").
        let a = Labels::from_pairs([("ab", "c")]).unwrap();
        let b = Labels::from_pairs([("a", "bc")]).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_without_label() {
        let labels = Labels::from_pairs([("job", "api"), ("replica", "r1")]).unwrap();
        let stripped = labels.without_label("replica");
        assert_eq!(stripped.get("replica"), None);
        assert_eq!(stripped.get("job"), Some("api"));
        assert_eq!(labels.without_label("absent"), labels);
    }
}
