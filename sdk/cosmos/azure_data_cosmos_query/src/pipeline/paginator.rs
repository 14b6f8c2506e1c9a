// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use futures::Stream;

use super::fetcher::Fetcher;
use crate::models::QueryPage;

/// A lazy, strictly sequential sequence of pages from a single [`Fetcher`].
///
/// A paginator cannot be rewound; start over with a fresh fetcher.
pub struct Paginator {
    fetcher: Fetcher,
}

impl Paginator {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }

    /// Fetches the next page, or returns `None` once the source is exhausted.
    pub async fn next_page(&mut self) -> Option<crate::Result<QueryPage>> {
        if !self.fetcher.should_fetch_more() {
            return None;
        }
        Some(self.fetcher.next_page().await)
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn into_fetcher(self) -> Fetcher {
        self.fetcher
    }

    /// Converts this paginator into a stream that ends after the last page or the first error.
    pub fn into_stream(self) -> impl Stream<Item = crate::Result<QueryPage>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut this = state?;
            match this.next_page().await? {
                Ok(page) => Some((Ok(page), Some(this))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
