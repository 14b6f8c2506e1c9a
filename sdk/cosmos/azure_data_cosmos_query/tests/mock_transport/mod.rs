// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use azure_core::http::StatusCode;
use azure_data_cosmos_query::{
    models::{AggregateKind, DocumentRid, PartitionKeyRange, QueryPlan, SortOrder},
    retry::ThrottlingRetryPolicy,
    routing::PartitionKeyRangeCache,
    transport::{QueryRequest, QueryResponse, QueryTransport},
    ContainerClient, HttpError, QueryPager, ResourceId,
};
use futures::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MockItem {
    pub id: String,
    /// The effective partition key, as a two digit hex string.
    pub partition_key: String,
    pub merge_order: i64,
}

pub fn item(id: impl Into<String>, partition_key: &str, merge_order: i64) -> MockItem {
    MockItem {
        id: id.into(),
        partition_key: partition_key.to_string(),
        merge_order,
    }
}

/// `per_range` items in each of the first `ranges` ranges, with merge orders interleaved across ranges.
pub fn spread_items(ranges: usize, per_range: usize) -> Vec<MockItem> {
    let partition_keys = ["10", "60", "B0"];
    let mut items = Vec::new();
    for (r, partition_key) in partition_keys.iter().take(ranges).enumerate() {
        for j in 0..per_range {
            let merge_order = (r + j * ranges) as i64;
            items.push(item(format!("{}-{}", r, j), partition_key, merge_order));
        }
    }
    items
}

pub fn three_ranges() -> Vec<PartitionKeyRange> {
    vec![
        PartitionKeyRange::new("0", "", "55"),
        PartitionKeyRange::new("1", "55", "AA"),
        PartitionKeyRange::new("2", "AA", "FF"),
    ]
}

pub fn two_ranges() -> Vec<PartitionKeyRange> {
    vec![
        PartitionKeyRange::new("0", "", "55"),
        PartitionKeyRange::new("1", "55", "FF"),
    ]
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum QueryMode {
    Unordered,
    OrderBy(SortOrder),
    Count,
}

struct PendingSplit {
    parent: String,
    after_pages: usize,
    children: Vec<PartitionKeyRange>,
}

#[derive(Default)]
struct MockState {
    requests: Vec<QueryRequest>,
    pages_served: HashMap<String, usize>,
    splits: Vec<PendingSplit>,
    throttles: usize,
}

/// An in-memory partitioned collection that answers direct, per-range and query plan requests.
///
/// Items are served in merge order (or insertion order for unordered queries). Range continuations are the
/// collection-wide ordinal of the last item served, so a continuation stays meaningful for the children of a split
/// range.
pub struct MockCollection {
    collection: ResourceId,
    cache: Arc<PartitionKeyRangeCache>,
    mode: QueryMode,
    plan: QueryPlan,
    items: Vec<(String, MockItem)>,
    embed_plan: bool,
    state: Mutex<MockState>,
}

impl MockCollection {
    pub fn new(ranges: Vec<PartitionKeyRange>, items: Vec<MockItem>, mode: QueryMode) -> Self {
        let collection = ResourceId::new("dbs/db/colls/items");
        let cache = PartitionKeyRangeCache::new();
        cache.set_ranges(collection.clone(), ranges);

        let mut items: Vec<_> = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| (DocumentRid::new(1, 1, i as u64 + 1), item))
            .collect();
        match mode {
            QueryMode::OrderBy(SortOrder::Ascending) => {
                items.sort_by(|a, b| (a.1.merge_order, a.0).cmp(&(b.1.merge_order, b.0)))
            }
            QueryMode::OrderBy(SortOrder::Descending) => {
                items.sort_by(|a, b| (b.1.merge_order, b.0).cmp(&(a.1.merge_order, a.0)))
            }
            QueryMode::Unordered | QueryMode::Count => {}
        }

        let mut plan = QueryPlan::default();
        match mode {
            QueryMode::Unordered => {}
            QueryMode::OrderBy(order) => {
                plan.query_info.order_by = vec![order];
                plan.query_info.order_by_expressions = vec!["c.mergeOrder".into()];
                plan.query_info.rewritten_query = "SELECT c._rid, [{\"item\": c.mergeOrder}] AS orderByItems, c AS payload FROM c WHERE {documentdb-formattableorderbyquery-filter} ORDER BY c.mergeOrder".into();
            }
            QueryMode::Count => {
                plan.query_info.aggregates = vec![AggregateKind::Count];
                plan.query_info.has_select_value = true;
                plan.query_info.rewritten_query =
                    "SELECT VALUE [{\"item\": COUNT(1)}] FROM c".into();
            }
        }

        Self {
            collection,
            cache: Arc::new(cache),
            mode,
            plan,
            items: items
                .into_iter()
                .map(|(rid, item)| (rid.to_string(), item))
                .collect(),
            embed_plan: true,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_top(mut self, top: u64) -> Self {
        self.plan.query_info.top = Some(top);
        self
    }

    /// Answers "not servable" without embedding the plan, so the client has to request one.
    pub fn without_embedded_plan(mut self) -> Self {
        self.embed_plan = false;
        self
    }

    /// Splits `parent` into `children` once it has served `after_pages` pages.
    pub fn split_after(
        self,
        parent: &str,
        after_pages: usize,
        children: Vec<PartitionKeyRange>,
    ) -> Self {
        self.state.lock().unwrap().splits.push(PendingSplit {
            parent: parent.to_string(),
            after_pages,
            children,
        });
        self
    }

    /// Throttles the next `count` requests.
    pub fn throttle(self, count: usize) -> Self {
        self.state.lock().unwrap().throttles = count;
        self
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn client(self: &Arc<Self>) -> ContainerClient {
        ContainerClient::new(self.collection.clone(), self.clone(), self.cache.clone())
            .with_retry_policy(Arc::new(
                ThrottlingRetryPolicy::default().with_base_delay(Duration::from_millis(1)),
            ))
    }

    pub fn requests(&self) -> Vec<QueryRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// The partition key range ids of every per-range request, in the order they were sent.
    pub fn range_requests(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r.pkrange_id.as_ref().map(|id| id.value().to_string()))
            .collect()
    }

    fn not_servable(&self) -> HttpError {
        let mut body = json!({
            "code": "BadRequest",
            "message": "The provided cross partition query can not be directly served by the gateway.",
        });
        if self.embed_plan {
            body["additionalErrorInfo"] = json!(serde_json::to_string(&self.plan).unwrap());
        }
        HttpError::new(StatusCode::BadRequest)
            .with_sub_status(1004)
            .with_body(body.to_string())
    }

    fn serve(&self, range: &PartitionKeyRange, request: &QueryRequest) -> QueryResponse {
        let in_range = |item: &MockItem| {
            item.partition_key.as_str() >= range.min_inclusive.as_str()
                && item.partition_key.as_str() < range.max_exclusive.as_str()
        };

        if self.mode == QueryMode::Count {
            let count = self.items.iter().filter(|(_, item)| in_range(item)).count();
            return QueryResponse::new(vec![json!([{ "item": count }])], None)
                .with_request_charge(1.0);
        }

        let after: Option<usize> = request
            .continuation
            .as_deref()
            .map(|c| c.parse().expect("mock continuations are ordinals"));
        let page_size = request
            .max_item_count
            .map_or(DEFAULT_PAGE_SIZE, |n| n as usize);
        let mut matching = self
            .items
            .iter()
            .enumerate()
            .filter(|(ordinal, (_, item))| in_range(item) && after.map_or(true, |a| *ordinal > a));
        let page: Vec<_> = matching.by_ref().take(page_size).collect();
        let continuation = match matching.next() {
            Some(_) => page.last().map(|(ordinal, _)| ordinal.to_string()),
            None => None,
        };

        let items = page
            .into_iter()
            .map(|(_, (rid, item))| self.render(rid, item))
            .collect();
        QueryResponse::new(items, continuation).with_request_charge(1.0)
    }

    fn render(&self, rid: &str, item: &MockItem) -> Value {
        match self.mode {
            QueryMode::OrderBy(_) => json!({
                "_rid": rid,
                "orderByItems": [{ "item": item.merge_order }],
                "payload": item,
            }),
            _ => serde_json::to_value(item).unwrap(),
        }
    }
}

#[async_trait]
impl QueryTransport for MockCollection {
    async fn execute(&self, request: QueryRequest) -> azure_data_cosmos_query::Result<QueryResponse> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        if state.throttles > 0 {
            state.throttles -= 1;
            return Err(HttpError::new(StatusCode::TooManyRequests)
                .with_retry_after(Duration::from_millis(1))
                .into());
        }

        let Some(pkrange_id) = request.pkrange_id.as_ref() else {
            return Err(self.not_servable().into());
        };
        let current = self.cache.ranges(&self.collection).unwrap_or_default();
        let Some(range) = current.iter().find(|r| &r.id == pkrange_id) else {
            return Err(HttpError::new(StatusCode::Gone).with_sub_status(1002).into());
        };

        let response = self.serve(range, &request);

        let served = state
            .pages_served
            .entry(pkrange_id.value().to_string())
            .or_default();
        *served += 1;
        let served = *served;
        if let Some(index) = state
            .splits
            .iter()
            .position(|s| s.parent == pkrange_id.value() && served >= s.after_pages)
        {
            let split = state.splits.remove(index);
            self.cache
                .apply_split(&self.collection, pkrange_id, split.children)
                .unwrap();
        }

        Ok(response)
    }

    async fn query_plan(&self, _request: QueryRequest) -> azure_data_cosmos_query::Result<QueryPlan> {
        Ok(self.plan.clone())
    }
}

/// Pulls at most `limit` pages, returning their items and the continuation of the last page pulled.
pub async fn collect_pages<T: DeserializeOwned>(
    pager: &mut QueryPager<T>,
    limit: Option<usize>,
) -> (Vec<T>, Vec<Option<String>>) {
    let mut items = Vec::new();
    let mut continuations = Vec::new();
    while limit.map_or(true, |l| continuations.len() < l) {
        let Some(page) = pager.next().await else {
            break;
        };
        let page = page.unwrap();
        continuations.push(page.continuation().map(str::to_string));
        items.extend(page.into_items());
    }
    (items, continuations)
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
