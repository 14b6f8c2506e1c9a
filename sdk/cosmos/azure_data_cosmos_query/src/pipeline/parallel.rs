// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt, StreamExt};

use super::{
    continuation::{CompositeContinuationToken, ContinuationToken, TokenRange},
    producer::{ProducerEvent, QueryContext, RangeProducer, RangeRegistry},
    PageSource,
};
use crate::models::QueryPage;

struct Slot {
    producer: RangeProducer,

    /// A prefetched page and the continuation it was requested with.
    pending: Option<(QueryPage, Option<String>)>,
}

impl Slot {
    fn needs_prefetch(&self) -> bool {
        self.pending.is_none() && !self.producer.is_exhausted()
    }

    fn is_drained(&self) -> bool {
        self.pending.is_none() && self.producer.is_exhausted()
    }

    fn resume_continuation(&self) -> Option<String> {
        match &self.pending {
            Some((_, request_continuation)) => request_continuation.clone(),
            None => self.producer.continuation().map(str::to_owned),
        }
    }
}

/// Concatenates the pages of each range, in key range order.
///
/// The current range and up to `max_degree_of_parallelism - 1` ranges after it prefetch one page each, so ranges
/// further down the list are usually ready by the time they are reached.
pub struct ParallelStage {
    context: Arc<QueryContext>,
    slots: Vec<Slot>,
    registry: RangeRegistry,
}

impl ParallelStage {
    /// Creates a stage over `producers`, which must be ordered by key range.
    pub fn new(context: Arc<QueryContext>, producers: Vec<RangeProducer>) -> Self {
        let mut registry = RangeRegistry::new();
        for producer in &producers {
            registry.register(producer.range());
        }
        tracing::debug!(ranges = producers.len(), "created parallel stage");
        Self {
            context,
            slots: producers
                .into_iter()
                .map(|producer| Slot {
                    producer,
                    pending: None,
                })
                .collect(),
            registry,
        }
    }

    pub fn registry(&self) -> &RangeRegistry {
        &self.registry
    }

    /// Prefetches one page for each slot in the window starting at `current`.
    async fn prefetch(&mut self, current: usize) -> crate::Result<()> {
        let window = self.context.max_degree_of_parallelism;
        let pending: Vec<BoxFuture<'_, (usize, crate::Result<ProducerEvent>)>> = self
            .slots
            .iter_mut()
            .enumerate()
            .skip(current)
            .take(window)
            .filter(|(_, slot)| slot.needs_prefetch())
            .map(|(i, slot)| async move { (i, slot.producer.next_event().await) }.boxed())
            .collect();
        let mut results: Vec<_> = futures::stream::iter(pending)
            .buffer_unordered(window)
            .collect()
            .await;

        results.sort_by(|a, b| b.0.cmp(&a.0));
        let mut first_error = None;
        for (i, result) in results {
            match result {
                // Empty pages consume nothing, so the producer's own continuation still resumes correctly.
                Ok(ProducerEvent::Page { page, .. }) if page.is_empty() => {}
                Ok(ProducerEvent::Page {
                    page,
                    request_continuation,
                }) => self.slots[i].pending = Some((page, request_continuation)),
                Ok(ProducerEvent::Exhausted) => {}
                Ok(ProducerEvent::Split(children)) => {
                    let parent = self.slots.remove(i);
                    let child_ranges: Vec<_> = children.iter().map(|c| c.range().clone()).collect();
                    self.registry
                        .record_split(parent.producer.range(), &child_ranges);
                    self.slots.splice(
                        i..i,
                        children.into_iter().map(|producer| Slot {
                            producer,
                            pending: None,
                        }),
                    );
                }
                Err(e) => first_error = Some(e),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn continuation(&self) -> crate::Result<Option<String>> {
        if self.slots.iter().all(Slot::is_drained) {
            return Ok(None);
        }
        let ranges = self
            .slots
            .iter()
            .map(|slot| CompositeContinuationToken {
                token: slot.resume_continuation(),
                range: TokenRange::from(slot.producer.range()),
                done: slot.is_drained(),
            })
            .collect();
        ContinuationToken::Composite(ranges).encode().map(Some)
    }
}

#[async_trait]
impl PageSource for ParallelStage {
    async fn next_page(&mut self) -> crate::Result<Option<QueryPage>> {
        loop {
            let Some(current) = self.slots.iter().position(|s| !s.is_drained()) else {
                return Ok(None);
            };
            if self.slots[current].pending.is_none() {
                self.prefetch(current).await?;
            }

            let Some((page, _)) = self.slots[current].pending.take() else {
                // Exhausted, returned an empty page, or replaced by split children.
                continue;
            };

            let pkrange_id = self.slots[current].producer.range().id.clone();
            let continuation = self.continuation()?;
            tracing::trace!(
                %pkrange_id,
                item_count = page.len(),
                ?continuation,
                "emitting page"
            );
            let (items, _, _) = page.into_parts();
            return Ok(Some(
                QueryPage::new(items, continuation)
                    .with_request_charge(self.context.charges.drain())
                    .with_pkrange_id(pkrange_id),
            ));
        }
    }
}
