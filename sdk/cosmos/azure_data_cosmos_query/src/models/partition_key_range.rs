// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use serde::{Deserialize, Serialize};

use crate::{constants, PartitionKeyRangeId};

/// A contiguous slice `[min_inclusive, max_exclusive)` of a collection's effective partition key space.
///
/// Ranges are immutable once observed. A split supersedes a range with children that list it in [`parents`](Self::parents).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyRange {
    pub id: PartitionKeyRangeId,
    pub min_inclusive: String,
    pub max_exclusive: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<PartitionKeyRangeId>,
}

impl PartitionKeyRange {
    pub fn new(
        id: impl Into<PartitionKeyRangeId>,
        min_inclusive: impl Into<String>,
        max_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
            parents: Vec::new(),
        }
    }

    pub fn with_parents(mut self, parents: impl IntoIterator<Item = PartitionKeyRangeId>) -> Self {
        self.parents = parents.into_iter().collect();
        self
    }

    /// The key range this partition key range covers.
    pub fn key_range(&self) -> KeyRange {
        KeyRange::new(self.min_inclusive.clone(), self.max_exclusive.clone())
    }

    /// Whether this range overlaps the given key range, honouring its inclusivity flags.
    pub fn overlaps(&self, range: &KeyRange) -> bool {
        // `[a, b)` never contains `b`, even when the other range starts there inclusively.
        if self.max_exclusive <= range.min {
            return false;
        }
        if range.max < self.min_inclusive
            || (range.max == self.min_inclusive && !range.is_max_inclusive)
        {
            return false;
        }
        true
    }

    /// Whether this range lies entirely within `[min, max)`.
    pub fn is_within(&self, min: &str, max: &str) -> bool {
        self.min_inclusive.as_str() >= min && self.max_exclusive.as_str() <= max
    }
}

/// A range of effective partition keys, as found in query plans.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRange {
    pub min: String,
    pub max: String,
    #[serde(default = "default_true")]
    pub is_min_inclusive: bool,
    #[serde(default)]
    pub is_max_inclusive: bool,
}

fn default_true() -> bool {
    true
}

impl KeyRange {
    /// Creates a `[min, max)` key range.
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
            is_min_inclusive: true,
            is_max_inclusive: false,
        }
    }

    /// The whole effective partition key space.
    pub fn full() -> Self {
        Self::new(
            constants::MIN_EFFECTIVE_PARTITION_KEY,
            constants::MAX_EFFECTIVE_PARTITION_KEY,
        )
    }
}

/// The body of a partition key ranges feed response.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PartitionKeyRanges {
    #[serde(rename = "PartitionKeyRanges")]
    pub ranges: Vec<PartitionKeyRange>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkrange(min: &str, max: &str) -> PartitionKeyRange {
        PartitionKeyRange::new("0", min, max)
    }

    #[test]
    fn overlap_respects_exclusive_max() {
        let range = pkrange("", "80");
        assert!(range.overlaps(&KeyRange::new("", "FF")));
        assert!(range.overlaps(&KeyRange::new("7F", "90")));
        assert!(!range.overlaps(&KeyRange::new("80", "FF")));
        assert!(!pkrange("80", "FF").overlaps(&KeyRange::new("", "80")));
    }

    #[test]
    fn point_range_overlaps_containing_range() {
        let point = KeyRange {
            min: "40".into(),
            max: "40".into(),
            is_min_inclusive: true,
            is_max_inclusive: true,
        };
        assert!(pkrange("", "80").overlaps(&point));
        assert!(!pkrange("80", "FF").overlaps(&point));
        assert!(pkrange("40", "80").overlaps(&point));
    }

    #[test]
    fn deserializes_feed_response() {
        let body = r#"{"PartitionKeyRanges":[
            {"id":"1","minInclusive":"","maxExclusive":"80","parents":["0"]},
            {"id":"2","minInclusive":"80","maxExclusive":"FF","parents":["0"]}
        ]}"#;
        let ranges: PartitionKeyRanges = serde_json::from_str(body).unwrap();
        assert_eq!(ranges.ranges.len(), 2);
        assert_eq!(ranges.ranges[1].parents, vec![PartitionKeyRangeId::new("0")]);
        assert!(ranges.ranges[0].is_within("", "FF"));
    }
}
