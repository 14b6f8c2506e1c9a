// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use crate::constants;

/// Consistency levels a query can request, overriding the account default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsistencyLevel {
    Strong,
    BoundedStaleness,
    Session,
    ConsistentPrefix,
    Eventual,
}

impl ConsistencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyLevel::Strong => "Strong",
            ConsistencyLevel::BoundedStaleness => "BoundedStaleness",
            ConsistencyLevel::Session => "Session",
            ConsistencyLevel::ConsistentPrefix => "ConsistentPrefix",
            ConsistencyLevel::Eventual => "Eventual",
        }
    }
}

/// Options to be passed to [`ContainerClient::query_items()`](crate::ContainerClient::query_items()).
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// The maximum number of items per page. The service default applies when unset.
    pub max_item_count: Option<u32>,

    /// The maximum number of partition key ranges queried concurrently.
    pub max_degree_of_parallelism: usize,

    /// Whether the query may fan out across partition key ranges.
    pub enable_cross_partition_query: bool,

    pub consistency_level: Option<ConsistencyLevel>,

    pub session_token: Option<String>,

    /// A continuation token from a previous page, to resume the query after it.
    pub continuation: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_item_count: None,
            max_degree_of_parallelism: constants::DEFAULT_MAX_DEGREE_OF_PARALLELISM,
            enable_cross_partition_query: true,
            consistency_level: None,
            session_token: None,
            continuation: None,
        }
    }
}

impl QueryOptions {
    /// Creates a new [`QueryOptionsBuilder`] that can be used to construct a [`QueryOptions`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// let options = azure_data_cosmos_query::QueryOptions::builder()
    ///     .with_max_item_count(50)
    ///     .build();
    /// assert_eq!(options.max_item_count, Some(50));
    /// ```
    pub fn builder() -> QueryOptionsBuilder {
        QueryOptionsBuilder::default()
    }

    /// The page size merging stages emit.
    pub(crate) fn effective_page_size(&self) -> u32 {
        self.max_item_count
            .unwrap_or(constants::DEFAULT_MAX_ITEM_COUNT)
            .max(1)
    }
}

/// Builder used to construct a [`QueryOptions`].
///
/// Obtain a [`QueryOptionsBuilder`] by calling [`QueryOptions::builder()`]
#[derive(Default)]
pub struct QueryOptionsBuilder(QueryOptions);

impl QueryOptionsBuilder {
    pub fn with_max_item_count(mut self, max_item_count: u32) -> Self {
        self.0.max_item_count = Some(max_item_count);
        self
    }

    pub fn with_max_degree_of_parallelism(mut self, max_degree_of_parallelism: usize) -> Self {
        self.0.max_degree_of_parallelism = max_degree_of_parallelism.max(1);
        self
    }

    pub fn with_cross_partition_query(mut self, enabled: bool) -> Self {
        self.0.enable_cross_partition_query = enabled;
        self
    }

    pub fn with_consistency_level(mut self, consistency_level: ConsistencyLevel) -> Self {
        self.0.consistency_level = Some(consistency_level);
        self
    }

    pub fn with_session_token(mut self, session_token: impl Into<String>) -> Self {
        self.0.session_token = Some(session_token.into());
        self
    }

    pub fn with_continuation(mut self, continuation: impl Into<String>) -> Self {
        self.0.continuation = Some(continuation.into());
        self
    }

    /// Builds a [`QueryOptions`] from the builder.
    ///
    /// This does not consume the builder, and can be called multiple times.
    pub fn build(&self) -> QueryOptions {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = QueryOptions::default();
        assert!(options.enable_cross_partition_query);
        assert_eq!(options.max_degree_of_parallelism, 10);
        assert_eq!(options.effective_page_size(), 100);
    }

    #[test]
    fn effective_page_size_is_at_least_one() {
        let options = QueryOptions::builder().with_max_item_count(5).build();
        assert_eq!(options.effective_page_size(), 5);
        let options = QueryOptions::builder().with_max_item_count(0).build();
        assert_eq!(options.effective_page_size(), 1);
    }

    #[test]
    fn builder_clamps_parallelism() {
        let options = QueryOptions::builder()
            .with_max_degree_of_parallelism(0)
            .with_cross_partition_query(false)
            .build();
        assert_eq!(options.max_degree_of_parallelism, 1);
        assert!(!options.enable_cross_partition_query);
    }
}
