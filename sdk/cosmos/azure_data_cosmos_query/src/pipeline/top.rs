// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use async_trait::async_trait;

use super::{
    continuation::{ContinuationToken, TakeContinuationToken},
    PageSource,
};
use crate::models::QueryPage;

/// Caps the total number of items an inner stage emits.
///
/// Continuations are wrapped in a take token carrying the number of items still allowed, and cleared once the
/// limit is reached.
pub struct TopLimiter {
    inner: Box<dyn PageSource>,
    remaining: u64,
}

impl TopLimiter {
    /// Creates a limiter that emits at most `remaining` more items.
    pub fn new(inner: Box<dyn PageSource>, remaining: u64) -> Self {
        Self { inner, remaining }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

#[async_trait]
impl PageSource for TopLimiter {
    async fn next_page(&mut self) -> crate::Result<Option<QueryPage>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let Some(mut page) = self.inner.next_page().await? else {
            return Ok(None);
        };

        let len = page.len() as u64;
        if len >= self.remaining {
            tracing::debug!(
                item_count = len,
                remaining = self.remaining,
                "TOP reached, truncating page"
            );
            page.truncate(usize::try_from(self.remaining).unwrap_or(usize::MAX));
            page.set_continuation(None);
            self.remaining = 0;
            return Ok(Some(page));
        }

        self.remaining -= len;
        let continuation = match page.continuation() {
            Some(inner) => Some(
                ContinuationToken::Take(TakeContinuationToken {
                    remaining_count: self.remaining,
                    source: Box::new(ContinuationToken::decode(inner)?),
                })
                .encode()?,
            ),
            None => None,
        };
        page.set_continuation(continuation);
        Ok(Some(page))
    }
}
