// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! Assembles the stages of a cross-partition query from its plan.

use std::sync::Arc;

use futures::Stream;

use super::{
    aggregate::AggregateStage,
    continuation::{CompositeContinuationToken, ContinuationToken},
    order_by::{OrderByStage, ResumePoint},
    parallel::ParallelStage,
    producer::{QueryContext, RangeProducer},
    top::TopLimiter,
    PageSource,
};
use crate::{
    constants,
    error::TokenLayer,
    models::{PartitionKeyRange, QueryPage, QueryPlan},
    Error,
};

/// Builds a [`QueryPipeline`] for a query plan.
///
/// ```text
/// RangeProducer*  ->  OrderByStage | ParallelStage  ->  [AggregateStage]  ->  [TopLimiter]
/// ```
pub struct PipelineBuilder {
    context: QueryContext,
    plan: QueryPlan,
    page_size: Option<u32>,
    ranges: Option<Vec<PartitionKeyRange>>,
    resume: Option<ContinuationToken>,
}

/// A resumable position in one range.
struct Target {
    range: PartitionKeyRange,
    continuation: Option<String>,
    done: bool,
}

impl PipelineBuilder {
    /// Starts a builder. The context's request is the template for every per-range request; its query text is
    /// replaced by the plan's rewritten query, if any.
    pub fn new(context: QueryContext, plan: QueryPlan) -> Self {
        Self {
            context,
            plan,
            page_size: None,
            ranges: None,
            resume: None,
        }
    }

    /// Sets the number of items per emitted page. Defaults to the request's page size, or 100.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Targets these ranges instead of resolving the plan's query ranges.
    pub fn ranges(mut self, ranges: Vec<PartitionKeyRange>) -> Self {
        self.ranges = Some(ranges);
        self
    }

    /// Resumes from a token emitted by a previous pipeline for the same query.
    pub fn resume(mut self, token: ContinuationToken) -> Self {
        self.resume = Some(token);
        self
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn build(self) -> crate::Result<QueryPipeline> {
        let Self {
            mut context,
            plan,
            page_size,
            ranges,
            resume,
        } = self;
        let info = &plan.query_info;

        if plan.has_aggregates() && plan.has_order_by() {
            return Err(Error::Validation(
                "aggregates cannot be combined with ORDER BY in a cross-partition query".into(),
            ));
        }
        if plan.has_aggregates() && resume.is_some() {
            return Err(Error::Validation(
                "aggregate queries cannot be resumed from a continuation token".into(),
            ));
        }

        // Peel the take layer off first; it decides how many items are left.
        let (remaining, resume) = match (info.top, resume) {
            (Some(top), Some(ContinuationToken::Take(take))) => {
                if take.remaining_count > top {
                    return Err(Error::Validation(format!(
                        "continuation allows {} more items, but the query has TOP {}",
                        take.remaining_count, top
                    )));
                }
                (Some(take.remaining_count), Some(*take.source))
            }
            (Some(_), Some(_)) => {
                return Err(Error::invalid_continuation(
                    TokenLayer::Take,
                    "expected a take token for a query with TOP",
                ))
            }
            (None, Some(ContinuationToken::Take(_))) => {
                return Err(Error::invalid_continuation(
                    TokenLayer::Take,
                    "unexpected take token for a query without TOP",
                ))
            }
            (top, resume) => (top, resume),
        };

        let text = plan
            .partition_query_text(context.request.query.text())
            .into_owned();
        context.request.query = context.request.query.with_text(text);
        let page_size = page_size.unwrap_or_else(|| {
            context
                .request
                .max_item_count
                .unwrap_or(constants::DEFAULT_MAX_ITEM_COUNT)
                .max(1)
        });
        let page_size = match remaining {
            Some(remaining) => page_size.min(u32::try_from(remaining).unwrap_or(u32::MAX)).max(1),
            None => page_size,
        };

        let (targets, resume_point) = match resume {
            None => {
                let ranges = match ranges {
                    Some(ranges) => ranges,
                    None => resolve_plan_ranges(&context, &plan).await?,
                };
                let targets = ranges
                    .into_iter()
                    .map(|range| Target {
                        range,
                        continuation: None,
                        done: false,
                    })
                    .collect();
                (targets, None)
            }
            Some(ContinuationToken::OrderBy(tokens)) if plan.has_order_by() => {
                let resume_point = ResumePoint::from_tokens(&tokens, &info.order_by)?;
                let entries: Vec<_> = tokens.into_iter().map(|t| t.composite_token).collect();
                (resolve_token_ranges(&context, entries).await?, Some(resume_point))
            }
            Some(ContinuationToken::Composite(entries)) if !plan.has_order_by() => {
                (resolve_token_ranges(&context, entries).await?, None)
            }
            Some(_) if plan.has_order_by() => {
                return Err(Error::invalid_continuation(
                    TokenLayer::OrderBy,
                    "expected an order-by token for a query with ORDER BY",
                ))
            }
            Some(_) => {
                return Err(Error::invalid_continuation(
                    TokenLayer::Composite,
                    "expected a composite token for a query without ORDER BY",
                ))
            }
        };

        if targets.is_empty() {
            return Err(Error::Validation(
                "the query does not target any partition key range".into(),
            ));
        }
        if !context.request.enable_cross_partition && targets.len() > 1 {
            return Err(Error::Validation(format!(
                "the query spans {} partition key ranges, but cross-partition queries are disabled",
                targets.len()
            )));
        }

        // Resumed ORDER BY ranges discard already-emitted items, so their fetch count cannot be capped.
        let per_range_top = if resume_point.is_some() { None } else { remaining };
        let per_range_page_size = if plan.has_order_by() {
            let size = match (remaining, resume_point.is_some()) {
                (Some(top), false) => {
                    let per_range = (top as f64 / targets.len() as f64
                        * constants::ORDER_BY_TOP_PAGE_SIZE_FACTOR)
                        .ceil();
                    (per_range as u32).clamp(1, page_size)
                }
                _ => page_size,
            };
            Some(size)
        } else {
            context.request.max_item_count
        };

        tracing::debug!(
            ranges = targets.len(),
            has_order_by = plan.has_order_by(),
            has_aggregates = plan.has_aggregates(),
            ?remaining,
            page_size,
            resumed = resume_point.is_some(),
            "building query pipeline"
        );

        let context = Arc::new(context);
        let producers: Vec<_> = targets
            .into_iter()
            .map(|target| {
                if target.done {
                    RangeProducer::drained(context.clone(), target.range)
                } else {
                    RangeProducer::new(
                        context.clone(),
                        target.range,
                        target.continuation,
                        per_range_page_size,
                        per_range_top,
                    )
                }
            })
            .collect();

        let mut source: Box<dyn PageSource> = if plan.has_order_by() {
            Box::new(OrderByStage::new(
                context.clone(),
                producers,
                info.order_by.clone(),
                page_size,
                resume_point,
            ))
        } else {
            Box::new(ParallelStage::new(context.clone(), producers))
        };
        if plan.has_aggregates() {
            source = Box::new(AggregateStage::new(source, &info.aggregates));
        }
        if let Some(remaining) = remaining {
            source = Box::new(TopLimiter::new(source, remaining));
        }

        Ok(QueryPipeline { source })
    }
}

/// Resolves the plan's query ranges to the current partition key ranges, in key order.
async fn resolve_plan_ranges(
    context: &QueryContext,
    plan: &QueryPlan,
) -> crate::Result<Vec<PartitionKeyRange>> {
    let mut ranges: Vec<PartitionKeyRange> = Vec::new();
    for query_range in plan.target_ranges() {
        let resolved = context
            .directory
            .resolve_ranges(&context.request.collection, &query_range)
            .await?;
        for range in resolved {
            if !ranges.iter().any(|r| r.id == range.id) {
                ranges.push(range);
            }
        }
    }
    ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
    Ok(ranges)
}

/// Maps each token entry onto the ranges that currently cover it, which differ from the token's if a range split
/// since the token was issued.
async fn resolve_token_ranges(
    context: &QueryContext,
    mut entries: Vec<CompositeContinuationToken>,
) -> crate::Result<Vec<Target>> {
    entries.sort_by(|a, b| a.range.min.cmp(&b.range.min));

    let mut targets = Vec::new();
    for entry in entries {
        if entry.done {
            targets.push(Target {
                range: entry.range.to_partition_key_range(),
                continuation: None,
                done: true,
            });
            continue;
        }

        let current = context
            .directory
            .resolve_ranges(&context.request.collection, &entry.range.key_range())
            .await?;
        if current.is_empty() {
            return Err(Error::UnresolvablePartitionRange(entry.range.id));
        }
        if let Some(merged) = current
            .iter()
            .find(|r| !r.is_within(&entry.range.min, &entry.range.max))
        {
            return Err(Error::Validation(format!(
                "partition key range '{}' was merged into '{}'; resuming across merges is not supported",
                entry.range.id, merged.id
            )));
        }
        if current.len() > 1 || current[0].id != entry.range.id {
            tracing::debug!(
                pkrange_id = %entry.range.id,
                successors = current.len(),
                "continuation range was split"
            );
        }
        for range in current {
            targets.push(Target {
                range,
                continuation: entry.token.clone(),
                done: false,
            });
        }
    }
    Ok(targets)
}

/// A composed cross-partition query.
pub struct QueryPipeline {
    source: Box<dyn PageSource>,
}

impl QueryPipeline {
    /// Produces the next page, or `None` when the query is complete.
    ///
    /// An error does not end the pipeline; calling this again retries the failed work.
    pub async fn next_page(&mut self) -> crate::Result<Option<QueryPage>> {
        self.source.next_page().await
    }

    /// Drives the pipeline to completion as a stream. Errors are yielded without ending the stream.
    pub fn into_stream(self) -> impl Stream<Item = crate::Result<QueryPage>> + Send {
        futures::stream::unfold(self, |mut pipeline| async move {
            pipeline
                .next_page()
                .await
                .transpose()
                .map(|result| (result, pipeline))
        })
    }
}
