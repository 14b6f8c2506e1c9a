// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! The `ORDER BY` k-way merge.

use std::{cmp::Ordering, collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use super::{
    continuation::{
        CompositeContinuationToken, ContinuationToken, OrderByContinuationToken, OrderByItem,
        TokenRange,
    },
    producer::{ProducerEvent, QueryContext, RangeProducer, RangeRegistry},
    PageSource,
};
use crate::{
    error::TokenLayer,
    models::{DocumentRid, QueryPage, SortOrder},
    Error,
};

/// Compares two sort values in the service's type order:
/// undefined < null < booleans < numbers < strings < arrays < objects.
///
/// `None` is undefined. Arrays compare equal to arrays and objects to objects.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) => 5,
            Some(Value::Object(_)) => 6,
        }
    }

    match (a, b) {
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// The position of an item in merge order.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OrderByKey {
    values: Vec<Option<Value>>,
    rid: DocumentRid,
}

impl OrderByKey {
    /// Compares by each sort value in its own direction, then by rid in the first direction.
    fn merge_cmp(&self, other: &Self, orders: &[SortOrder]) -> Ordering {
        for (i, order) in orders.iter().enumerate() {
            let ordering = compare_values(
                self.values.get(i).and_then(Option::as_ref),
                other.values.get(i).and_then(Option::as_ref),
            );
            let ordering = directed(ordering, *order);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        directed(
            self.rid.cmp(&other.rid),
            orders.first().copied().unwrap_or(SortOrder::Ascending),
        )
    }
}

fn directed(ordering: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Ascending => ordering,
        SortOrder::Descending => ordering.reverse(),
    }
}

/// The last item a merge emitted, from which a resumed merge continues.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumePoint {
    key: OrderByKey,
    rid: String,
    inclusive: bool,
}

impl ResumePoint {
    /// Reads the resume point shared by every entry of an `ORDER BY` token.
    pub fn from_tokens(
        tokens: &[OrderByContinuationToken],
        orders: &[SortOrder],
    ) -> crate::Result<Self> {
        let first = tokens
            .first()
            .ok_or_else(|| Error::invalid_continuation(TokenLayer::OrderBy, "no ranges"))?;
        if tokens
            .iter()
            .any(|t| t.order_by_items != first.order_by_items || t.rid != first.rid)
        {
            return Err(Error::invalid_continuation(
                TokenLayer::OrderBy,
                "ranges disagree on the last emitted item",
            ));
        }
        if first.order_by_items.len() != orders.len() {
            return Err(Error::invalid_continuation(
                TokenLayer::OrderBy,
                format!(
                    "expected {} order by items, found {}",
                    orders.len(),
                    first.order_by_items.len()
                ),
            ));
        }
        let rid: DocumentRid = first
            .rid
            .parse()
            .map_err(|e: Error| Error::invalid_continuation(TokenLayer::OrderBy, e.to_string()))?;

        Ok(Self {
            key: OrderByKey {
                values: first.order_by_items.iter().map(|i| i.item.clone()).collect(),
                rid,
            },
            rid: first.rid.clone(),
            inclusive: first.inclusive,
        })
    }

    /// Whether an item at `key` has not been emitted yet.
    fn admits(&self, key: &OrderByKey, orders: &[SortOrder]) -> bool {
        match key.merge_cmp(&self.key, orders) {
            Ordering::Less => false,
            Ordering::Equal => self.inclusive,
            Ordering::Greater => true,
        }
    }
}

#[derive(Deserialize)]
struct RawOrderByResult {
    #[serde(rename = "_rid")]
    rid: String,
    #[serde(rename = "orderByItems")]
    order_by_items: Vec<OrderByItem>,
    payload: Value,
}

struct OrderByResult {
    key: OrderByKey,
    rid: String,
    payload: Value,
}

impl OrderByResult {
    fn parse(item: Value, orders: &[SortOrder]) -> crate::Result<Self> {
        let raw: RawOrderByResult = serde_json::from_value(item).map_err(|e| {
            Error::InvalidResponse(format!("unexpected ORDER BY result shape: {}", e))
        })?;
        if raw.order_by_items.len() != orders.len() {
            return Err(Error::InvalidResponse(format!(
                "expected {} order by items, found {}",
                orders.len(),
                raw.order_by_items.len()
            )));
        }
        Ok(Self {
            key: OrderByKey {
                values: raw.order_by_items.into_iter().map(|i| i.item).collect(),
                rid: raw.rid.parse()?,
            },
            rid: raw.rid,
            payload: raw.payload,
        })
    }
}

struct Slot {
    producer: RangeProducer,
    buffer: VecDeque<OrderByResult>,

    /// Requests the page `buffer` came from again.
    buffer_continuation: Option<String>,
    filter: Option<Arc<ResumePoint>>,
}

impl Slot {
    fn new(producer: RangeProducer, filter: Option<Arc<ResumePoint>>) -> Self {
        Self {
            producer,
            buffer: VecDeque::new(),
            buffer_continuation: None,
            filter,
        }
    }

    fn needs_refill(&self) -> bool {
        self.buffer.is_empty() && !self.producer.is_exhausted()
    }

    fn is_drained(&self) -> bool {
        self.buffer.is_empty() && self.producer.is_exhausted()
    }

    /// Where this range resumes so that no buffered item is lost.
    fn resume_continuation(&self) -> Option<String> {
        if self.buffer.is_empty() {
            self.producer.continuation().map(str::to_owned)
        } else {
            self.buffer_continuation.clone()
        }
    }

    fn accept(
        &mut self,
        page: QueryPage,
        request_continuation: Option<String>,
        orders: &[SortOrder],
    ) -> crate::Result<()> {
        let results = page
            .into_items()
            .into_iter()
            .map(|item| OrderByResult::parse(item, orders))
            .collect::<crate::Result<Vec<_>>>()?;

        for result in results {
            if let Some(filter) = &self.filter {
                if !filter.admits(&result.key, orders) {
                    continue;
                }
                // Ranges are sorted, so nothing after this can precede the resume point.
                self.filter = None;
            }
            self.buffer.push_back(result);
        }
        self.buffer_continuation = request_continuation;
        Ok(())
    }
}

/// Merges per-range `ORDER BY` results into one sorted stream of payloads.
///
/// Every range keeps at most one page buffered. Ranges with an empty buffer are refilled concurrently, up to the
/// context's degree of parallelism; the merge itself only ever looks at buffered heads, so its output does not
/// depend on which response arrives first.
pub struct OrderByStage {
    context: Arc<QueryContext>,
    orders: Vec<SortOrder>,
    page_size: usize,
    slots: Vec<Slot>,
    registry: RangeRegistry,
    last_emitted: Option<(OrderByKey, String)>,

    /// Reported by the next call, after the page holding the items merged before it failed.
    deferred_error: Option<Error>,

    /// Set once a range returned a page that could not be parsed. That page cannot be requested again, so the
    /// stage stops.
    failed: Option<String>,
}

impl OrderByStage {
    /// Creates a merge over `producers`, which must be ordered by key range.
    ///
    /// With a `resume` point, every range drops the items that were emitted before it.
    pub fn new(
        context: Arc<QueryContext>,
        producers: Vec<RangeProducer>,
        orders: Vec<SortOrder>,
        page_size: u32,
        resume: Option<ResumePoint>,
    ) -> Self {
        let mut registry = RangeRegistry::new();
        for producer in &producers {
            registry.register(producer.range());
        }
        let last_emitted = resume.as_ref().map(|r| (r.key.clone(), r.rid.clone()));
        let filter = resume.map(Arc::new);
        tracing::debug!(
            ranges = producers.len(),
            ?orders,
            page_size,
            resumed = filter.is_some(),
            "created ORDER BY stage"
        );

        Self {
            context,
            orders,
            page_size: usize::try_from(page_size).unwrap_or(usize::MAX).max(1),
            slots: producers
                .into_iter()
                .map(|p| Slot::new(p, filter.clone()))
                .collect(),
            registry,
            last_emitted,
            deferred_error: None,
            failed: None,
        }
    }

    pub fn registry(&self) -> &RangeRegistry {
        &self.registry
    }

    /// Refills every slot whose buffer is empty, until each has a head or is drained.
    async fn refill(&mut self) -> crate::Result<()> {
        let max_concurrency = self.context.max_degree_of_parallelism;
        loop {
            let pending: Vec<BoxFuture<'_, (usize, crate::Result<ProducerEvent>)>> = self
                .slots
                .iter_mut()
                .enumerate()
                .filter(|(_, slot)| slot.needs_refill())
                .map(|(i, slot)| async move { (i, slot.producer.next_event().await) }.boxed())
                .collect();
            let mut results: Vec<_> = futures::stream::iter(pending)
                .buffer_unordered(max_concurrency)
                .collect()
                .await;
            if results.is_empty() {
                return Ok(());
            }

            // Highest index first, so splicing in split children keeps lower indices valid.
            results.sort_by(|a, b| b.0.cmp(&a.0));
            let mut first_error = None;
            for (i, result) in results {
                match result {
                    Ok(ProducerEvent::Page {
                        page,
                        request_continuation,
                    }) => {
                        if let Err(e) = self.slots[i].accept(page, request_continuation, &self.orders) {
                            tracing::warn!(error = %e, "range returned an unreadable ORDER BY page");
                            self.failed = Some(e.to_string());
                            first_error = Some(e);
                        }
                    }
                    Ok(ProducerEvent::Exhausted) => {}
                    Ok(ProducerEvent::Split(children)) => self.replace_with_children(i, children),
                    Err(e) => first_error = Some(e),
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }
    }

    fn replace_with_children(&mut self, index: usize, children: Vec<RangeProducer>) {
        let parent = self.slots.remove(index);
        let child_ranges: Vec<_> = children.iter().map(|c| c.range().clone()).collect();
        self.registry
            .record_split(parent.producer.range(), &child_ranges);
        let filter = parent.filter;
        self.slots.splice(
            index..index,
            children.into_iter().map(|c| Slot::new(c, filter.clone())),
        );
    }

    /// The slot holding the next item in merge order.
    fn select(&self) -> Option<usize> {
        let orders = &self.orders;
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.buffer.front().map(|head| (i, head)))
            .min_by(|(_, a), (_, b)| a.key.merge_cmp(&b.key, orders))
            .map(|(i, _)| i)
    }

    fn continuation(&self) -> crate::Result<Option<String>> {
        if self.slots.iter().all(Slot::is_drained) {
            return Ok(None);
        }
        let Some((key, rid)) = &self.last_emitted else {
            return Err(Error::InvalidOperation(
                "ORDER BY continuation requested before any item was emitted".into(),
            ));
        };

        let order_by_items: Vec<_> = key
            .values
            .iter()
            .map(|item| OrderByItem { item: item.clone() })
            .collect();
        let ranges = self
            .slots
            .iter()
            .map(|slot| OrderByContinuationToken {
                composite_token: CompositeContinuationToken {
                    token: slot.resume_continuation(),
                    range: TokenRange::from(slot.producer.range()),
                    done: slot.is_drained(),
                },
                order_by_items: order_by_items.clone(),
                rid: rid.clone(),
                inclusive: false,
            })
            .collect();
        ContinuationToken::OrderBy(ranges).encode().map(Some)
    }
}

#[async_trait]
impl PageSource for OrderByStage {
    async fn next_page(&mut self) -> crate::Result<Option<QueryPage>> {
        if let Some(e) = self.deferred_error.take() {
            return Err(e);
        }
        if let Some(message) = &self.failed {
            return Err(Error::InvalidResponse(format!(
                "an earlier ORDER BY page could not be read: {}",
                message
            )));
        }

        let mut items = Vec::with_capacity(self.page_size);
        while items.len() < self.page_size {
            if let Err(e) = self.refill().await {
                if items.is_empty() || self.failed.is_some() {
                    return Err(e);
                }
                // The failed range kept its state and is retried after the error is reported.
                tracing::debug!(error = %e, item_count = items.len(), "emitting partial ORDER BY page");
                self.deferred_error = Some(e);
                break;
            }

            let Some(index) = self.select() else {
                break;
            };
            let Some(result) = self.slots[index].buffer.pop_front() else {
                break;
            };
            self.last_emitted = Some((result.key, result.rid));
            items.push(result.payload);
        }

        if items.is_empty() {
            return Ok(None);
        }

        let continuation = self.continuation()?;
        tracing::trace!(item_count = items.len(), ?continuation, "emitting ORDER BY page");
        Ok(Some(
            QueryPage::new(items, continuation).with_request_charge(self.context.charges.drain()),
        ))
    }
}
