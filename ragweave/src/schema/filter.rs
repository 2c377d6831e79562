//! Metadata filter expressions evaluated against node metadata.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::node::Metadata;

/// Comparison applied between a metadata value and the filter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    /// Equal.
    #[default]
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Metadata value is one of the filter's array elements.
    In,
    /// Metadata value is none of the filter's array elements.
    Nin,
    /// Metadata string contains the filter string.
    TextMatch,
}

/// How a group of filters combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    /// Every member must match.
    #[default]
    And,
    /// At least one member must match.
    Or,
}

/// One predicate over a metadata key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    /// Metadata key to test.
    pub key: String,
    /// Value to compare against.
    pub value: Value,
    /// Comparison to apply.
    #[serde(default)]
    pub operator: FilterOperator,
}

impl MetadataFilter {
    /// Build a predicate.
    pub fn new(key: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self { key: key.into(), value: value.into(), operator }
    }

    /// Equality predicate.
    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(key, FilterOperator::Eq, value)
    }

    /// Evaluate against a metadata map. Missing keys never match.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        let Some(actual) = metadata.get(&self.key) else {
            return false;
        };
        match self.operator {
            FilterOperator::Eq => values_equal(actual, &self.value),
            FilterOperator::Ne => !values_equal(actual, &self.value),
            FilterOperator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Gte => {
                matches!(compare(actual, &self.value), Some(Ordering::Greater | Ordering::Equal))
            }
            FilterOperator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Lte => {
                matches!(compare(actual, &self.value), Some(Ordering::Less | Ordering::Equal))
            }
            FilterOperator::In => contains(&self.value, actual),
            FilterOperator::Nin => !contains(&self.value, actual),
            FilterOperator::TextMatch => match (actual.as_str(), self.value.as_str()) {
                (Some(haystack), Some(needle)) => haystack.contains(needle),
                _ => false,
            },
        }
    }
}

/// A member of a filter group: a predicate or a nested group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    /// Leaf predicate.
    Filter(MetadataFilter),
    /// Nested group.
    Group(MetadataFilters),
}

/// A tree of predicates joined by AND/OR.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetadataFilters {
    /// Members of this group.
    pub filters: Vec<FilterNode>,
    /// How the members combine.
    #[serde(default)]
    pub condition: FilterCondition,
}

impl MetadataFilters {
    /// AND-group of predicates.
    pub fn all(filters: impl IntoIterator<Item = MetadataFilter>) -> Self {
        Self {
            filters: filters.into_iter().map(FilterNode::Filter).collect(),
            condition: FilterCondition::And,
        }
    }

    /// OR-group of predicates.
    pub fn any(filters: impl IntoIterator<Item = MetadataFilter>) -> Self {
        Self {
            filters: filters.into_iter().map(FilterNode::Filter).collect(),
            condition: FilterCondition::Or,
        }
    }

    /// Append a nested group.
    pub fn with_group(mut self, group: MetadataFilters) -> Self {
        self.filters.push(FilterNode::Group(group));
        self
    }

    /// Evaluate the tree. An empty group matches everything.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        let eval = |node: &FilterNode| match node {
            FilterNode::Filter(filter) => filter.matches(metadata),
            FilterNode::Group(group) => group.matches(metadata),
        };
        match self.condition {
            FilterCondition::And => self.filters.iter().all(eval),
            FilterCondition::Or => self.filters.iter().any(eval),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(list: &Value, needle: &Value) -> bool {
    match list {
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        single => values_equal(single, needle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> Metadata {
        Metadata::from([
            ("author".to_string(), json!("ada")),
            ("year".to_string(), json!(2021)),
            ("title".to_string(), json!("notes on engines")),
        ])
    }

    #[test]
    fn comparisons() {
        let m = meta();
        assert!(MetadataFilter::equals("author", "ada").matches(&m));
        assert!(MetadataFilter::new("year", FilterOperator::Gte, 2021).matches(&m));
        assert!(!MetadataFilter::new("year", FilterOperator::Gt, 2021).matches(&m));
        assert!(MetadataFilter::new("year", FilterOperator::Lt, 2022.5).matches(&m));
        let filter = MetadataFilter::new("author", FilterOperator::In, json!(["bob", "ada"]));
        assert!(filter.matches(&m));
        assert!(MetadataFilter::new("author", FilterOperator::Nin, json!(["bob"])).matches(&m));
        assert!(MetadataFilter::new("title", FilterOperator::TextMatch, "engine").matches(&m));
        assert!(!MetadataFilter::equals("missing", "x").matches(&m));
    }

    #[test]
    fn nested_groups() {
        let m = meta();
        let filters = MetadataFilters::all([MetadataFilter::equals("author", "ada")]).with_group(
            MetadataFilters::any([
                MetadataFilter::equals("year", 1999),
                MetadataFilter::new("title", FilterOperator::TextMatch, "notes"),
            ]),
        );
        assert!(filters.matches(&m));
        let strict = MetadataFilters::all([
            MetadataFilter::equals("author", "ada"),
            MetadataFilter::equals("year", 1999),
        ]);
        assert!(!strict.matches(&m));
        assert!(MetadataFilters::default().matches(&m));
    }
}
