// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;

use crate::{
    models::{QueryPager, QueryPlan},
    pipeline::{ContinuationToken, CrossPartitionQueryExecutor},
    retry::{RetryPolicy, RetryingTransport, ThrottlingRetryPolicy},
    routing::PartitionKeyRangeDirectory,
    transport::QueryTransport,
    Query, QueryOptions, ResourceId,
};

/// A client for querying the items of a single collection.
///
/// Every request is sent through the configured [`RetryPolicy`], which by default retries throttled and timed out
/// requests.
pub struct ContainerClient {
    collection: ResourceId,
    transport: Arc<dyn QueryTransport>,
    directory: Arc<dyn PartitionKeyRangeDirectory>,
    retry_policy: Arc<dyn RetryPolicy>,
}

impl ContainerClient {
    /// Creates a client for `collection`.
    ///
    /// # Arguments
    ///
    /// * `collection` - The collection to query.
    /// * `transport` - Sends requests to the service.
    /// * `directory` - Resolves the partition key ranges of the collection.
    pub fn new(
        collection: ResourceId,
        transport: Arc<dyn QueryTransport>,
        directory: Arc<dyn PartitionKeyRangeDirectory>,
    ) -> Self {
        Self {
            collection,
            transport,
            directory,
            retry_policy: Arc::new(ThrottlingRetryPolicy::default()),
        }
    }

    /// Replaces the retry policy used for every request this client sends.
    pub fn with_retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Returns the collection this client queries.
    pub fn collection(&self) -> &ResourceId {
        &self.collection
    }

    /// Executes a query against the items in the collection.
    ///
    /// The query is first sent to the gateway as-is. If the gateway reports that it cannot serve the query from a
    /// single request (for example, because it has an `ORDER BY` spanning several partitions), the query is
    /// re-planned and executed across partition key ranges.
    ///
    /// # Arguments
    ///
    /// * `query` - The query to execute.
    /// * `options` - Optional parameters for the request.
    ///
    /// # Errors
    ///
    /// Returns an error immediately if the continuation in `options` is a malformed client continuation token. All
    /// other errors are reported through the returned pager.
    ///
    /// # Examples
    ///
    /// The `query` parameter accepts anything that can be transformed [`Into`] a [`Query`].
    ///
    /// ```rust,no_run
    /// # async fn doc() {
    /// # use azure_data_cosmos_query::ContainerClient;
    /// # use futures::StreamExt;
    /// # let container_client: ContainerClient = panic!("this is a non-running example");
    /// let mut pager = container_client
    ///     .query_items::<serde_json::Value>("SELECT * FROM c ORDER BY c.name", None)
    ///     .unwrap();
    /// while let Some(page) = pager.next().await {
    ///     for item in page.unwrap().items() {
    ///         println!("{}", item);
    ///     }
    /// }
    /// # }
    /// ```
    pub fn query_items<T: DeserializeOwned + Send + 'static>(
        &self,
        query: impl Into<Query>,
        options: Option<QueryOptions>,
    ) -> crate::Result<QueryPager<T>> {
        let executor = self.executor(query.into(), options.unwrap_or_default())?;
        Ok(into_pager(executor))
    }

    /// Executes a query using a plan obtained ahead of time, skipping the initial gateway attempt.
    ///
    /// A continuation in `options` must be a token returned by an earlier cross-partition execution.
    pub fn execute_query<T: DeserializeOwned + Send + 'static>(
        &self,
        query: impl Into<Query>,
        plan: QueryPlan,
        options: Option<QueryOptions>,
    ) -> crate::Result<QueryPager<T>> {
        let executor = self
            .executor(query.into(), options.unwrap_or_default())?
            .with_plan(plan);
        Ok(into_pager(executor))
    }

    fn executor(
        &self,
        query: Query,
        options: QueryOptions,
    ) -> crate::Result<CrossPartitionQueryExecutor> {
        if let Some(continuation) = options.continuation.as_deref() {
            ContinuationToken::sniff(continuation)?;
        }
        let transport = Arc::new(RetryingTransport::new(
            self.transport.clone(),
            self.retry_policy.clone(),
        ));
        Ok(CrossPartitionQueryExecutor::new(
            transport,
            self.directory.clone(),
            self.collection.clone(),
            query,
            options,
        ))
    }
}

fn into_pager<T: DeserializeOwned + Send + 'static>(
    executor: CrossPartitionQueryExecutor,
) -> QueryPager<T> {
    Box::pin(
        executor
            .into_stream()
            .map(|page| page.and_then(|page| page.deserialize_items())),
    )
}
