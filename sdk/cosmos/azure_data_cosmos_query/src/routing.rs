// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! Resolution of collections to their current partition key ranges.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;

use crate::{
    models::{KeyRange, PartitionKeyRange, PartitionKeyRanges},
    Error, PartitionKeyRangeId, ResourceId,
};

/// Maps a collection to its current set of partition key ranges.
#[async_trait]
pub trait PartitionKeyRangeDirectory: Send + Sync {
    /// Returns the current ranges overlapping `range`, ordered by their minimum key.
    async fn resolve_ranges(
        &self,
        collection: &ResourceId,
        range: &KeyRange,
    ) -> crate::Result<Vec<PartitionKeyRange>>;

    /// Returns the current ranges that replaced `parent` after a split, ordered by their minimum key.
    ///
    /// An empty list means the successors are not known.
    async fn resolve_child_ranges(
        &self,
        collection: &ResourceId,
        parent: &PartitionKeyRangeId,
    ) -> crate::Result<Vec<PartitionKeyRange>>;
}

/// An in-memory [`PartitionKeyRangeDirectory`], refreshed from partition key range feed responses.
#[derive(Debug, Default)]
pub struct PartitionKeyRangeCache {
    collections: RwLock<HashMap<ResourceId, Vec<PartitionKeyRange>>>,
}

impl PartitionKeyRangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the known ranges of a collection.
    pub fn set_ranges(
        &self,
        collection: ResourceId,
        ranges: impl IntoIterator<Item = PartitionKeyRange>,
    ) {
        let mut ranges: Vec<_> = ranges.into_iter().collect();
        ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection, ranges);
    }

    /// Replaces the known ranges of a collection from a `{"PartitionKeyRanges": [...]}` response body.
    pub fn set_ranges_from_feed(&self, collection: ResourceId, body: &[u8]) -> crate::Result<()> {
        let feed: PartitionKeyRanges = serde_json::from_slice(body)?;
        self.set_ranges(collection, feed.ranges);
        Ok(())
    }

    /// Records that `parent` split into `children`.
    ///
    /// Each child's `parents` becomes the parent's ancestry followed by the parent itself.
    pub fn apply_split(
        &self,
        collection: &ResourceId,
        parent: &PartitionKeyRangeId,
        children: impl IntoIterator<Item = PartitionKeyRange>,
    ) -> crate::Result<()> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let ranges = collections
            .get_mut(collection)
            .ok_or_else(|| unknown_collection(collection))?;
        let index = ranges
            .iter()
            .position(|r| &r.id == parent)
            .ok_or_else(|| Error::UnresolvablePartitionRange(parent.clone()))?;
        let removed = ranges.remove(index);

        let mut lineage = removed.parents.clone();
        lineage.push(removed.id.clone());
        for child in children {
            ranges.push(child.with_parents(lineage.clone()));
        }
        ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
        Ok(())
    }

    pub fn ranges(&self, collection: &ResourceId) -> Option<Vec<PartitionKeyRange>> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .cloned()
    }
}

fn unknown_collection(collection: &ResourceId) -> Error {
    Error::Validation(format!(
        "no partition key ranges are known for collection '{}'",
        collection
    ))
}

#[async_trait]
impl PartitionKeyRangeDirectory for PartitionKeyRangeCache {
    async fn resolve_ranges(
        &self,
        collection: &ResourceId,
        range: &KeyRange,
    ) -> crate::Result<Vec<PartitionKeyRange>> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let ranges = collections
            .get(collection)
            .ok_or_else(|| unknown_collection(collection))?;
        Ok(ranges.iter().filter(|r| r.overlaps(range)).cloned().collect())
    }

    async fn resolve_child_ranges(
        &self,
        collection: &ResourceId,
        parent: &PartitionKeyRangeId,
    ) -> crate::Result<Vec<PartitionKeyRange>> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let ranges = collections
            .get(collection)
            .ok_or_else(|| unknown_collection(collection))?;
        Ok(ranges
            .iter()
            .filter(|r| r.parents.contains(parent))
            .cloned()
            .collect())
    }
}
