// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! The stages of a cross-partition query.
//!
//! A query is executed by a chain of [`PageSource`]s, built innermost first by the [`PipelineBuilder`]:
//! per-range [`RangeProducer`]s feed either an [`OrderByStage`] or a [`ParallelStage`], optionally
//! followed by an [`AggregateStage`] and a [`TopLimiter`]. The [`CrossPartitionQueryExecutor`] decides
//! whether a pipeline is needed at all.

use async_trait::async_trait;

use crate::models::QueryPage;

pub mod aggregate;
pub mod composer;
pub mod continuation;
pub mod executor;
pub mod fetcher;
pub mod order_by;
pub mod paginator;
pub mod parallel;
pub mod producer;
pub mod top;

pub use aggregate::AggregateStage;
pub use composer::{PipelineBuilder, QueryPipeline};
pub use continuation::ContinuationToken;
pub use executor::CrossPartitionQueryExecutor;
pub use fetcher::Fetcher;
pub use order_by::OrderByStage;
pub use paginator::Paginator;
pub use parallel::ParallelStage;
pub use producer::{ProducerEvent, QueryContext, RangeProducer, RangeRegistry, RequestChargeTracker};
pub use top::TopLimiter;

/// A stage that produces pages of raw items.
///
/// `Ok(None)` means the stage is exhausted. An error leaves the stage usable: the next call
/// retries the work that failed.
#[async_trait]
pub trait PageSource: Send {
    async fn next_page(&mut self) -> crate::Result<Option<QueryPage>>;
}

#[async_trait]
impl<S: PageSource + ?Sized> PageSource for Box<S> {
    async fn next_page(&mut self) -> crate::Result<Option<QueryPage>> {
        (**self).next_page().await
    }
}
