// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use std::pin::Pin;

use futures::Stream;
use serde::de::DeserializeOwned;

use crate::PartitionKeyRangeId;

/// A single page of query results.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryPage<T = serde_json::Value> {
    items: Vec<T>,
    continuation: Option<String>,
    request_charge: f64,
    pkrange_id: Option<PartitionKeyRangeId>,
}

/// A stream of query result pages.
pub type QueryPager<T> = Pin<Box<dyn Stream<Item = crate::Result<QueryPage<T>>> + Send>>;

impl<T> QueryPage<T> {
    pub fn new(items: Vec<T>, continuation: Option<String>) -> Self {
        Self {
            items,
            continuation,
            request_charge: 0.0,
            pkrange_id: None,
        }
    }

    pub fn with_request_charge(mut self, request_charge: f64) -> Self {
        self.request_charge = request_charge;
        self
    }

    pub fn with_pkrange_id(mut self, pkrange_id: PartitionKeyRangeId) -> Self {
        self.pkrange_id = Some(pkrange_id);
        self
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// The token to resume the query after this page, or `None` if the query is complete.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// The total request units charged for the requests that produced this page.
    pub fn request_charge(&self) -> f64 {
        self.request_charge
    }

    /// The partition key range this page came from, when it came from exactly one.
    pub fn pkrange_id(&self) -> Option<&PartitionKeyRangeId> {
        self.pkrange_id.as_ref()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn set_continuation(&mut self, continuation: Option<String>) {
        self.continuation = continuation;
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }

    pub(crate) fn into_parts(self) -> (Vec<T>, Option<String>, f64) {
        (self.items, self.continuation, self.request_charge)
    }
}

impl QueryPage<serde_json::Value> {
    /// Deserializes every item into `T`, keeping the page metadata.
    pub fn deserialize_items<T: DeserializeOwned>(self) -> crate::Result<QueryPage<T>> {
        let items = self
            .items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()?;
        Ok(QueryPage {
            items,
            continuation: self.continuation,
            request_charge: self.request_charge,
            pkrange_id: self.pkrange_id,
        })
    }
}
