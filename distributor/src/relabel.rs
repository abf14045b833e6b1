use data_types::Labels;

/// A relabel rule applied to a series before validation.
///
/// Rules are evaluated in order; a series dropped by one rule is not seen
/// by later rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelabelRule {
    /// Drop the whole series when `label` has exactly `value`.
    DropSeries {
        /// Label to match on.
        label: String,
        /// Value that triggers the drop.
        value: String,
    },
    /// Keep only series where `label` has exactly `value`.
    KeepSeries {
        /// Label to match on.
        label: String,
        /// Required value.
        value: String,
    },
    /// Remove the label named `name` from the series.
    DropLabel {
        /// Label to remove.
        name: String,
    },
}

/// Apply `rules` then strip `drop_labels`, returning the resulting label
/// set or `None` when the series is dropped.
///
/// A series whose labels all get removed is dropped as well.
pub fn relabel(labels: &Labels, rules: &[RelabelRule], drop_labels: &[String]) -> Option<Labels> {
    let mut labels = labels.clone();

    for rule in rules {
        match rule {
            RelabelRule::DropSeries { label, value } => {
                if labels.get(label) == Some(value.as_str()) {
                    return None;
                }
            }
            RelabelRule::KeepSeries { label, value } => {
                if labels.get(label) != Some(value.as_str()) {
                    return None;
                }
            }
            RelabelRule::DropLabel { name } => {
                labels = labels.without_label(name);
            }
        }
    }

    for name in drop_labels {
        labels = labels.without_label(name);
    }

    if labels.is_empty() {
        return None;
    }
    Some(labels)
}
