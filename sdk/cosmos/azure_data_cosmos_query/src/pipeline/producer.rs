// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! Per-range producers and the state shared between them.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use super::{fetcher::Fetcher, paginator::Paginator};
use crate::{
    error::{classify, ErrorClass},
    models::{PartitionKeyRange, QueryPage},
    routing::PartitionKeyRangeDirectory,
    transport::{QueryRequest, QueryTransport},
    Error, PartitionKeyRangeId,
};

/// Accumulates request charges from concurrent producers until a stage drains them into a page.
#[derive(Debug, Default)]
pub struct RequestChargeTracker {
    bits: AtomicU64,
}

impl RequestChargeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, charge: f64) {
        if charge == 0.0 {
            return;
        }
        // The closure always returns `Some`, so this cannot fail.
        let _ = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + charge).to_bits())
            });
    }

    /// Returns the accumulated charge and resets it to zero.
    pub fn drain(&self) -> f64 {
        f64::from_bits(self.bits.swap(0f64.to_bits(), Ordering::AcqRel))
    }
}

/// Everything the producers of one pipeline share.
pub struct QueryContext {
    pub(crate) transport: Arc<dyn QueryTransport>,
    pub(crate) directory: Arc<dyn PartitionKeyRangeDirectory>,

    /// The template every per-range request is cloned from.
    pub(crate) request: QueryRequest,
    pub(crate) max_degree_of_parallelism: usize,
    pub(crate) charges: RequestChargeTracker,
}

impl QueryContext {
    pub fn new(
        transport: Arc<dyn QueryTransport>,
        directory: Arc<dyn PartitionKeyRangeDirectory>,
        request: QueryRequest,
        max_degree_of_parallelism: usize,
    ) -> Self {
        Self {
            transport,
            directory,
            request,
            max_degree_of_parallelism: max_degree_of_parallelism.max(1),
            charges: RequestChargeTracker::new(),
        }
    }

    pub fn request(&self) -> &QueryRequest {
        &self.request
    }

    pub fn charges(&self) -> &RequestChargeTracker {
        &self.charges
    }
}

/// What a [`RangeProducer`] produced when asked for more.
pub enum ProducerEvent {
    /// A page of items. `request_continuation` is the continuation the page was requested with,
    /// which fetches the same page again.
    Page {
        page: QueryPage,
        request_continuation: Option<String>,
    },

    /// The range has no more items.
    Exhausted,

    /// The range split. The producer must be replaced by these children, ordered by key range.
    Split(Vec<RangeProducer>),
}

/// Owns the pagination state of one partition key range.
pub struct RangeProducer {
    context: Arc<QueryContext>,
    range: PartitionKeyRange,
    pages: Paginator,
}

impl RangeProducer {
    /// Creates a producer that starts at `continuation`, or at the beginning of the range.
    pub fn new(
        context: Arc<QueryContext>,
        range: PartitionKeyRange,
        continuation: Option<String>,
        max_item_count: Option<u32>,
        top: Option<u64>,
    ) -> Self {
        let request = context
            .request
            .for_range(range.id.clone())
            .for_page(continuation.as_deref(), max_item_count);
        let mut fetcher = Fetcher::new(context.transport.clone(), request);
        if let Some(top) = top {
            fetcher = fetcher.with_top(top);
        }
        Self {
            context,
            range,
            pages: Paginator::new(fetcher),
        }
    }

    /// Creates a producer for a range that a previous invocation already drained.
    pub fn drained(context: Arc<QueryContext>, range: PartitionKeyRange) -> Self {
        let request = context.request.for_range(range.id.clone());
        Self {
            context,
            range,
            pages: Paginator::new(Fetcher::finished(context.transport.clone(), request)),
        }
    }

    pub fn range(&self) -> &PartitionKeyRange {
        &self.range
    }

    /// The continuation the next request will be sent with.
    pub fn continuation(&self) -> Option<&str> {
        self.pages.fetcher().continuation()
    }

    pub fn is_exhausted(&self) -> bool {
        !self.pages.fetcher().should_fetch_more()
    }

    /// Fetches the next page of this range.
    ///
    /// A split is resolved here and reported as [`ProducerEvent::Split`]. Any other error is returned
    /// as-is and leaves the producer ready to request the same page again.
    pub async fn next_event(&mut self) -> crate::Result<ProducerEvent> {
        let request_continuation = self.continuation().map(str::to_owned);
        match self.pages.next_page().await {
            None => Ok(ProducerEvent::Exhausted),
            Some(Ok(page)) => {
                self.context.charges.add(page.request_charge());
                Ok(ProducerEvent::Page {
                    page,
                    request_continuation,
                })
            }
            Some(Err(e)) if classify(&e) == ErrorClass::PartitionGone => {
                tracing::debug!(pkrange_id = %self.range.id, error = %e, "partition key range is gone");
                self.split(request_continuation).await.map(ProducerEvent::Split)
            }
            Some(Err(e)) => Err(e),
        }
    }

    async fn split(&self, continuation: Option<String>) -> crate::Result<Vec<RangeProducer>> {
        let children = self
            .context
            .directory
            .resolve_child_ranges(&self.context.request.collection, &self.range.id)
            .await?;
        if children.is_empty() {
            return Err(Error::UnresolvablePartitionRange(self.range.id.clone()));
        }

        tracing::debug!(
            pkrange_id = %self.range.id,
            children = ?children.iter().map(|c| c.id.value()).collect::<Vec<_>>(),
            ?continuation,
            "replacing partition key range with its children"
        );

        // Backend continuations are positions in the parent's key space, which every child inherits.
        Ok(children
            .into_iter()
            .map(|child| {
                RangeProducer::new(
                    self.context.clone(),
                    child,
                    continuation.clone(),
                    self.pages.fetcher().max_item_count(),
                    self.pages.fetcher().remaining_top(),
                )
            })
            .collect())
    }
}

/// An entry in a [`RangeRegistry`].
#[derive(Clone, Debug, PartialEq)]
pub enum RangeEntry {
    Active(PartitionKeyRange),
    Split {
        range: PartitionKeyRange,
        children: Vec<PartitionKeyRangeId>,
    },
}

/// Every range a stage has worked with, keyed by id.
///
/// Splits replace an `Active` entry with a `Split` entry and add the children, so ids seen earlier stay resolvable.
#[derive(Debug, Default)]
pub struct RangeRegistry {
    entries: BTreeMap<PartitionKeyRangeId, RangeEntry>,
}

impl RangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, range: &PartitionKeyRange) {
        self.entries
            .insert(range.id.clone(), RangeEntry::Active(range.clone()));
    }

    /// Records that `parent` was replaced by `children`.
    pub fn record_split(&mut self, parent: &PartitionKeyRange, children: &[PartitionKeyRange]) {
        self.entries.insert(
            parent.id.clone(),
            RangeEntry::Split {
                range: parent.clone(),
                children: children.iter().map(|c| c.id.clone()).collect(),
            },
        );
        for child in children {
            self.register(child);
        }
    }

    pub fn get(&self, id: &PartitionKeyRangeId) -> Option<&RangeEntry> {
        self.entries.get(id)
    }

    /// The ranges currently being queried, ordered by id.
    pub fn active(&self) -> impl Iterator<Item = &PartitionKeyRange> {
        self.entries.values().filter_map(|e| match e {
            RangeEntry::Active(range) => Some(range),
            RangeEntry::Split { .. } => None,
        })
    }

    /// The ranges that currently cover `id`'s key space: itself if active, or its descendants.
    pub fn successors(&self, id: &PartitionKeyRangeId) -> Vec<&PartitionKeyRange> {
        match self.entries.get(id) {
            Some(RangeEntry::Active(range)) => vec![range],
            Some(RangeEntry::Split { children, .. }) => {
                children.iter().flat_map(|c| self.successors(c)).collect()
            }
            None => Vec::new(),
        }
    }
}
