// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use serde::{Deserialize, Serialize};

use super::KeyRange;
use crate::constants;

/// Describes how a query must be executed across partitions.
///
/// Plans are produced by the gateway, either in response to a query plan request or embedded in a
/// "cross partition query not servable" error. A plan is fixed for the lifetime of a query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    #[serde(default)]
    pub partitioned_query_execution_info_version: u32,

    #[serde(default)]
    pub query_info: QueryInfo,

    /// The effective partition key ranges the query must target. Empty means all of them.
    #[serde(default)]
    pub query_ranges: Vec<KeyRange>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<u64>,

    #[serde(default)]
    pub order_by: Vec<SortOrder>,

    #[serde(default)]
    pub order_by_expressions: Vec<String>,

    #[serde(default)]
    pub aggregates: Vec<AggregateKind>,

    #[serde(default)]
    pub has_select_value: bool,

    /// The query to send to each partition, if the gateway rewrote it.
    #[serde(default)]
    pub rewritten_query: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateKind {
    Count,
    Sum,
    Min,
    Max,
    Average,
}

impl QueryPlan {
    pub fn has_order_by(&self) -> bool {
        !self.query_info.order_by.is_empty()
    }

    pub fn has_top(&self) -> bool {
        self.query_info.top.is_some()
    }

    pub fn has_aggregates(&self) -> bool {
        !self.query_info.aggregates.is_empty()
    }

    /// The ranges to target, defaulting to the whole key space.
    pub fn target_ranges(&self) -> Vec<KeyRange> {
        if self.query_ranges.is_empty() {
            vec![KeyRange::full()]
        } else {
            self.query_ranges.clone()
        }
    }

    /// The text each partition should run, given the query the caller supplied.
    pub fn partition_query_text<'a>(&'a self, original: &'a str) -> std::borrow::Cow<'a, str> {
        if self.query_info.rewritten_query.is_empty() {
            original.into()
        } else {
            self.query_info
                .rewritten_query
                .replace(constants::ORDER_BY_FILTER_PLACEHOLDER, "true")
                .into()
        }
    }
}
