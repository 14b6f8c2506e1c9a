// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! Single-source pagination state.

use std::sync::Arc;

use azure_core::http::StatusCode;

use crate::{
    models::QueryPage,
    transport::{QueryRequest, QueryTransport},
    Error,
};

/// Drives pagination against one source: decides whether another page is needed, requests it and
/// updates its own state from the response.
///
/// A failed request leaves the state untouched, so the same page can be requested again.
pub struct Fetcher {
    transport: Arc<dyn QueryTransport>,
    request: QueryRequest,
    continuation: Option<String>,
    remaining_top: Option<u64>,
    max_item_count: Option<u32>,
    should_fetch_more: bool,
    change_feed: bool,
}

impl Fetcher {
    /// Creates a fetcher starting at `request.continuation` with `request.max_item_count` as its page size.
    pub fn new(transport: Arc<dyn QueryTransport>, request: QueryRequest) -> Self {
        Self {
            continuation: request.continuation.clone(),
            max_item_count: request.max_item_count,
            transport,
            request,
            remaining_top: None,
            should_fetch_more: true,
            change_feed: false,
        }
    }

    /// Limits the total number of items this fetcher will ask for.
    pub fn with_top(mut self, top: u64) -> Self {
        self.remaining_top = Some(top);
        self.max_item_count = cap(self.max_item_count, top);
        if top == 0 {
            self.should_fetch_more = false;
        }
        self
    }

    /// Treats a `304 Not Modified` response as the end of the feed.
    pub fn with_change_feed(mut self) -> Self {
        self.change_feed = true;
        self
    }

    /// Creates a fetcher for a source that is already drained.
    pub fn finished(transport: Arc<dyn QueryTransport>, request: QueryRequest) -> Self {
        let mut fetcher = Self::new(transport, request);
        fetcher.continuation = None;
        fetcher.should_fetch_more = false;
        fetcher
    }

    pub fn should_fetch_more(&self) -> bool {
        self.should_fetch_more
    }

    /// The continuation the next request will be sent with.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    pub fn remaining_top(&self) -> Option<u64> {
        self.remaining_top
    }

    pub fn max_item_count(&self) -> Option<u32> {
        self.max_item_count
    }

    /// Requests the next page.
    ///
    /// Calling this once [`should_fetch_more`](Self::should_fetch_more) is `false` is an error.
    pub async fn next_page(&mut self) -> crate::Result<QueryPage> {
        if !self.should_fetch_more {
            return Err(Error::InvalidOperation(
                "next_page called on a fetcher with no more pages".into(),
            ));
        }

        let request = self
            .request
            .for_page(self.continuation.as_deref(), self.max_item_count);
        let pkrange_id = request.pkrange_id.clone();
        let response = self.transport.execute(request).await?;

        let item_count = response.items.len() as u64;
        if let Some(remaining) = self.remaining_top {
            if item_count > remaining {
                tracing::warn!(
                    item_count,
                    remaining,
                    ?pkrange_id,
                    "service returned more items than requested"
                );
            }
            let remaining = remaining.saturating_sub(item_count);
            self.remaining_top = Some(remaining);
            self.max_item_count = cap(self.max_item_count, remaining);
        }

        self.continuation = response.continuation.clone();
        let not_modified = self.change_feed && response.status == StatusCode::NotModified;
        self.should_fetch_more = self.continuation.is_some()
            && self.remaining_top != Some(0)
            && !not_modified;

        tracing::trace!(
            item_count,
            ?pkrange_id,
            continuation = ?self.continuation,
            should_fetch_more = self.should_fetch_more,
            "fetched page"
        );

        let mut page = QueryPage::new(response.items, response.continuation)
            .with_request_charge(response.request_charge);
        if let Some(pkrange_id) = pkrange_id {
            page = page.with_pkrange_id(pkrange_id);
        }
        Ok(page)
    }
}

fn cap(max_item_count: Option<u32>, remaining: u64) -> Option<u32> {
    let remaining = u32::try_from(remaining).unwrap_or(u32::MAX);
    Some(max_item_count.map_or(remaining, |max| max.min(remaining)))
}
