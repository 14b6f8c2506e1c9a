// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! Header names, sub-status codes and defaults used by the query pipeline.

pub const QUERY: &str = "x-ms-documentdb-isquery";
pub const IS_QUERY_PLAN: &str = "x-ms-cosmos-is-query-plan-request";
pub const SUPPORTED_QUERY_FEATURES: &str = "x-ms-cosmos-supported-query-features";
pub const PARTITION_KEY_RANGE_ID: &str = "x-ms-documentdb-partitionkeyrangeid";
pub const CONTINUATION: &str = "x-ms-continuation";
pub const MAX_ITEM_COUNT: &str = "x-ms-max-item-count";
pub const ENABLE_CROSS_PARTITION_QUERY: &str = "x-ms-documentdb-query-enablecrosspartition";
pub const IS_CONTINUATION_EXPECTED: &str = "x-ms-documentdb-query-iscontinuationexpected";
pub const CONSISTENCY_LEVEL: &str = "x-ms-consistency-level";
pub const SESSION_TOKEN: &str = "x-ms-session-token";
pub const REQUEST_CHARGE: &str = "x-ms-request-charge";
pub const SUB_STATUS: &str = "x-ms-substatus";
pub const RETRY_AFTER_MS: &str = "x-ms-retry-after-ms";
pub const CONTENT_TYPE: &str = "content-type";
pub const QUERY_CONTENT_TYPE: &str = "application/query+json";

/// Query features this pipeline can execute client-side, as advertised to the gateway when asking for a plan.
pub const SUPPORTED_FEATURES: &str = "OrderBy,MultipleOrderBy,Top,Aggregate";

pub mod sub_status {
    pub const PARTITION_KEY_RANGE_GONE: u32 = 1002;
    pub const CROSS_PARTITION_QUERY_NOT_SERVABLE: u32 = 1004;
    pub const COMPLETING_SPLIT: u32 = 1007;
    pub const COMPLETING_PARTITION_MIGRATION: u32 = 1008;
}

/// Lowest effective partition key.
pub const MIN_EFFECTIVE_PARTITION_KEY: &str = "";

/// Upper bound (exclusive) of the effective partition key space.
pub const MAX_EFFECTIVE_PARTITION_KEY: &str = "FF";

/// Page size used by merging stages when the caller did not ask for one.
pub const DEFAULT_MAX_ITEM_COUNT: u32 = 100;

pub const DEFAULT_MAX_DEGREE_OF_PARALLELISM: usize = 10;

/// Over-fetch factor for the first per-range page of an `ORDER BY` + `TOP` query.
///
/// Any value that yields a page size of at least one is correct; this only trades
/// request count against wasted items.
pub const ORDER_BY_TOP_PAGE_SIZE_FACTOR: f64 = 1.5;

/// Placeholder the gateway leaves in rewritten `ORDER BY` queries.
pub const ORDER_BY_FILTER_PLACEHOLDER: &str = "{documentdb-formattableorderbyquery-filter}";
