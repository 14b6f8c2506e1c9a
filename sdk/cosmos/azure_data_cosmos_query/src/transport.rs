// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! The contract between the query pipeline and the component that actually sends requests.

use async_trait::async_trait;
use azure_core::http::StatusCode;

use crate::{
    constants, models::QueryPlan, ConsistencyLevel, PartitionKeyRangeId, Query, QueryOptions,
    ResourceId,
};

/// Sends a single logical query request and returns one page of results.
///
/// Implementations own the HTTP stack, authentication and endpoint routing.
/// Failures are reported as [`Error::Http`](crate::Error::Http) so that the pipeline can classify them.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    /// Executes a query request, returning one page of raw results.
    async fn execute(&self, request: QueryRequest) -> crate::Result<QueryResponse>;

    /// Asks the gateway for the execution plan of the request's query.
    async fn query_plan(&self, request: QueryRequest) -> crate::Result<QueryPlan>;
}

/// A single query request against a collection.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryRequest {
    pub collection: ResourceId,
    pub query: Query,

    /// The partition key range to run against. `None` sends the query to the gateway un-partitioned.
    pub pkrange_id: Option<PartitionKeyRangeId>,
    pub continuation: Option<String>,
    pub max_item_count: Option<u32>,
    pub enable_cross_partition: bool,
    pub consistency_level: Option<ConsistencyLevel>,
    pub session_token: Option<String>,
    pub is_query_plan: bool,
}

impl QueryRequest {
    pub fn new(collection: ResourceId, query: Query) -> Self {
        Self {
            collection,
            query,
            pkrange_id: None,
            continuation: None,
            max_item_count: None,
            enable_cross_partition: false,
            consistency_level: None,
            session_token: None,
            is_query_plan: false,
        }
    }

    /// Creates a request carrying the per-query settings from `options`. The continuation is not copied.
    pub(crate) fn from_options(collection: ResourceId, query: Query, options: &QueryOptions) -> Self {
        Self {
            max_item_count: options.max_item_count,
            enable_cross_partition: options.enable_cross_partition_query,
            consistency_level: options.consistency_level,
            session_token: options.session_token.clone(),
            ..Self::new(collection, query)
        }
    }

    /// Clones this request as a template for one page.
    pub(crate) fn for_page(&self, continuation: Option<&str>, max_item_count: Option<u32>) -> Self {
        Self {
            continuation: continuation.map(str::to_owned),
            max_item_count,
            ..self.clone()
        }
    }

    /// Clones this request, targeting a single partition key range.
    pub(crate) fn for_range(&self, pkrange_id: PartitionKeyRangeId) -> Self {
        Self {
            pkrange_id: Some(pkrange_id),
            ..self.clone()
        }
    }

    /// Renders the request's settings as wire headers.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (constants::QUERY, "True".to_string()),
            (constants::CONTENT_TYPE, constants::QUERY_CONTENT_TYPE.to_string()),
        ];
        if self.is_query_plan {
            headers.push((constants::IS_QUERY_PLAN, "True".to_string()));
            headers.push((
                constants::SUPPORTED_QUERY_FEATURES,
                constants::SUPPORTED_FEATURES.to_string(),
            ));
        }
        if let Some(pkrange_id) = &self.pkrange_id {
            headers.push((constants::PARTITION_KEY_RANGE_ID, pkrange_id.to_string()));
            headers.push((constants::IS_CONTINUATION_EXPECTED, "False".to_string()));
        }
        if let Some(continuation) = &self.continuation {
            headers.push((constants::CONTINUATION, continuation.clone()));
        }
        if let Some(max_item_count) = self.max_item_count {
            headers.push((constants::MAX_ITEM_COUNT, max_item_count.to_string()));
        }
        if self.enable_cross_partition {
            headers.push((constants::ENABLE_CROSS_PARTITION_QUERY, "True".to_string()));
        }
        if let Some(level) = self.consistency_level {
            headers.push((constants::CONSISTENCY_LEVEL, level.as_str().to_string()));
        }
        if let Some(token) = &self.session_token {
            headers.push((constants::SESSION_TOKEN, token.clone()));
        }
        headers
    }
}

/// One page of raw results returned by a [`QueryTransport`].
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResponse {
    pub status: StatusCode,
    pub items: Vec<serde_json::Value>,
    pub continuation: Option<String>,
    pub request_charge: f64,
}

impl QueryResponse {
    pub fn new(items: Vec<serde_json::Value>, continuation: Option<String>) -> Self {
        Self {
            status: StatusCode::Ok,
            items,
            continuation,
            request_charge: 0.0,
        }
    }

    pub fn with_request_charge(mut self, request_charge: f64) -> Self {
        self.request_charge = request_charge;
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header<'a>(headers: &'a [(&'static str, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn range_request_headers() {
        let options = QueryOptions::builder()
            .with_max_item_count(10)
            .with_consistency_level(ConsistencyLevel::Session)
            .with_session_token("0:1#2")
            .build();
        let request = QueryRequest::from_options(
            ResourceId::new("dbs/db/colls/c"),
            Query::from("SELECT * FROM c"),
            &options,
        )
        .for_range(PartitionKeyRangeId::new("3"))
        .for_page(Some("abc"), Some(4));

        let headers = request.headers();
        assert_eq!(header(&headers, constants::PARTITION_KEY_RANGE_ID), Some("3"));
        assert_eq!(header(&headers, constants::CONTINUATION), Some("abc"));
        assert_eq!(header(&headers, constants::MAX_ITEM_COUNT), Some("4"));
        assert_eq!(header(&headers, constants::CONSISTENCY_LEVEL), Some("Session"));
        assert_eq!(header(&headers, constants::SESSION_TOKEN), Some("0:1#2"));
        assert_eq!(
            header(&headers, constants::ENABLE_CROSS_PARTITION_QUERY),
            Some("True")
        );
        assert_eq!(header(&headers, constants::IS_QUERY_PLAN), None);
    }

    #[test]
    fn query_plan_request_advertises_features() {
        let mut request = QueryRequest::new(ResourceId::new("c"), Query::from("SELECT 1"));
        request.is_query_plan = true;
        let headers = request.headers();
        assert_eq!(header(&headers, constants::IS_QUERY_PLAN), Some("True"));
        assert!(header(&headers, constants::SUPPORTED_QUERY_FEATURES)
            .unwrap()
            .contains("OrderBy"));
        assert_eq!(header(&headers, constants::PARTITION_KEY_RANGE_ID), None);
    }
}
