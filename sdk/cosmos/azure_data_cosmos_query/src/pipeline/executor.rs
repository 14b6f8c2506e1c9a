// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use std::sync::Arc;

use futures::Stream;

use super::{
    composer::{PipelineBuilder, QueryPipeline},
    continuation::ContinuationToken,
    producer::QueryContext,
};
use crate::{
    error::{classify, ErrorClass, TokenLayer},
    models::{QueryPage, QueryPlan},
    routing::PartitionKeyRangeDirectory,
    transport::{QueryRequest, QueryTransport},
    Error, HttpError, Query, QueryOptions, ResourceId,
};

enum ExecutorState {
    Initial,

    /// The gateway is serving the query as a single request.
    Direct {
        continuation: Option<String>,
    },

    /// The query is being fanned out across partition key ranges.
    Distributed(QueryPipeline),
    Done,
}

impl ExecutorState {
    fn name(&self) -> &'static str {
        match self {
            ExecutorState::Initial => "initial",
            ExecutorState::Direct { .. } => "direct",
            ExecutorState::Distributed(_) => "distributed",
            ExecutorState::Done => "done",
        }
    }
}

/// Runs a query, first as a single gateway request and, if the gateway cannot serve it, as a cross-partition
/// pipeline.
///
/// A client-side continuation token means a previous run already fanned out, so the executor goes straight to the
/// pipeline. Errors while running directly end the stream; errors from the pipeline are yielded and polling again
/// retries the failed page.
pub struct CrossPartitionQueryExecutor {
    transport: Arc<dyn QueryTransport>,
    directory: Arc<dyn PartitionKeyRangeDirectory>,
    collection: ResourceId,
    query: Query,
    options: QueryOptions,
    plan: Option<QueryPlan>,
}

impl CrossPartitionQueryExecutor {
    pub fn new(
        transport: Arc<dyn QueryTransport>,
        directory: Arc<dyn PartitionKeyRangeDirectory>,
        collection: ResourceId,
        query: Query,
        options: QueryOptions,
    ) -> Self {
        Self {
            transport,
            directory,
            collection,
            query,
            options,
            plan: None,
        }
    }

    /// Skips the gateway attempt and executes `plan` directly.
    pub fn with_plan(mut self, plan: QueryPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn into_stream(self) -> impl Stream<Item = crate::Result<QueryPage>> + Send {
        futures::stream::unfold(
            (self, ExecutorState::Initial),
            |(this, state)| async move {
                tracing::trace!(state = state.name(), "polling query executor");
                let (result, next) = this.step(state).await?;
                Some((result, (this, next)))
            },
        )
    }

    async fn step(
        &self,
        mut state: ExecutorState,
    ) -> Option<(crate::Result<QueryPage>, ExecutorState)> {
        loop {
            state = match state {
                ExecutorState::Initial => match self.initial().await {
                    Ok(next) => next,
                    Err(e) => return Some((Err(e), ExecutorState::Done)),
                },
                ExecutorState::Direct { continuation } => return self.direct(continuation).await,
                ExecutorState::Distributed(pipeline) => return self.distributed(pipeline).await,
                ExecutorState::Done => return None,
            };
        }
    }

    fn request(&self) -> QueryRequest {
        QueryRequest::from_options(self.collection.clone(), self.query.clone(), &self.options)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn initial(&self) -> crate::Result<ExecutorState> {
        let resume = match self.options.continuation.as_deref() {
            Some(continuation) => ContinuationToken::sniff(continuation)?,
            None => None,
        };

        match (&self.plan, resume) {
            (Some(_), None) if self.options.continuation.is_some() => {
                Err(Error::invalid_continuation(
                    TokenLayer::Envelope,
                    "a cross-partition query can only resume from a client continuation token",
                ))
            }
            (Some(plan), resume) => {
                let pipeline = self.build_pipeline(plan.clone(), resume).await?;
                Ok(ExecutorState::Distributed(pipeline))
            }
            (None, Some(token)) => {
                tracing::debug!("client continuation supplied, skipping the gateway attempt");
                let plan = self.fetch_plan().await?;
                let pipeline = self.build_pipeline(plan, Some(token)).await?;
                Ok(ExecutorState::Distributed(pipeline))
            }
            (None, None) => Ok(ExecutorState::Direct {
                continuation: self.options.continuation.clone(),
            }),
        }
    }

    async fn direct(
        &self,
        continuation: Option<String>,
    ) -> Option<(crate::Result<QueryPage>, ExecutorState)> {
        let request = self
            .request()
            .for_page(continuation.as_deref(), self.options.max_item_count);
        match self.transport.execute(request).await {
            Ok(response) => {
                let next = match &response.continuation {
                    Some(c) => ExecutorState::Direct {
                        continuation: Some(c.clone()),
                    },
                    None => ExecutorState::Done,
                };
                let page = QueryPage::new(response.items, response.continuation)
                    .with_request_charge(response.request_charge);
                Some((Ok(page), next))
            }
            // Only the first request can be re-planned; later pages would be emitted twice.
            Err(e) if classify(&e) == ErrorClass::NeedsReplan && continuation.is_none() => {
                match self.replan(&e).await {
                    Ok(pipeline) => self.distributed(pipeline).await,
                    Err(e) => Some((Err(e), ExecutorState::Done)),
                }
            }
            Err(e) => Some((Err(e), ExecutorState::Done)),
        }
    }

    async fn distributed(
        &self,
        mut pipeline: QueryPipeline,
    ) -> Option<(crate::Result<QueryPage>, ExecutorState)> {
        match pipeline.next_page().await {
            Ok(Some(page)) => Some((Ok(page), ExecutorState::Distributed(pipeline))),
            Ok(None) => None,
            Err(e) => Some((Err(e), ExecutorState::Distributed(pipeline))),
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn replan(&self, error: &Error) -> crate::Result<QueryPipeline> {
        let embedded = error
            .as_http()
            .map(HttpError::query_plan)
            .transpose()?
            .flatten();
        let plan = match embedded {
            Some(plan) => plan,
            None => self.fetch_plan().await?,
        };
        tracing::debug!(
            has_order_by = plan.has_order_by(),
            has_top = plan.has_top(),
            has_aggregates = plan.has_aggregates(),
            "gateway cannot serve the query directly, switching to a cross-partition pipeline"
        );
        self.build_pipeline(plan, None).await
    }

    async fn fetch_plan(&self) -> crate::Result<QueryPlan> {
        let mut request = self.request();
        request.is_query_plan = true;
        self.transport.query_plan(request).await
    }

    async fn build_pipeline(
        &self,
        plan: QueryPlan,
        resume: Option<ContinuationToken>,
    ) -> crate::Result<QueryPipeline> {
        let context = QueryContext::new(
            self.transport.clone(),
            self.directory.clone(),
            self.request(),
            self.options.max_degree_of_parallelism,
        );
        let mut builder = PipelineBuilder::new(context, plan)
            .page_size(self.options.effective_page_size());
        if let Some(token) = resume {
            builder = builder.resume(token);
        }
        builder.build().await
    }
}

#[cfg(test)]
mod tests {
    use azure_core::http::StatusCode;
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::{
        models::PartitionKeyRange, pipeline::fetcher::tests::ScriptedTransport,
        routing::PartitionKeyRangeCache, transport::QueryResponse,
    };

    fn executor(transport: Arc<ScriptedTransport>, options: QueryOptions) -> CrossPartitionQueryExecutor {
        let cache = PartitionKeyRangeCache::new();
        cache.set_ranges(
            ResourceId::new("c"),
            [
                PartitionKeyRange::new("0", "", "80"),
                PartitionKeyRange::new("1", "80", "FF"),
            ],
        );
        CrossPartitionQueryExecutor::new(
            transport,
            Arc::new(cache),
            ResourceId::new("c"),
            Query::from("SELECT * FROM c"),
            options,
        )
    }

    fn not_servable(plan: Option<&str>) -> crate::Result<QueryResponse> {
        let mut body = json!({ "code": "BadRequest", "message": "cross partition query not servable" });
        if let Some(plan) = plan {
            body["additionalErrorInfo"] = json!(plan);
        }
        Err(HttpError::new(StatusCode::BadRequest)
            .with_sub_status(1004)
            .with_body(body.to_string())
            .into())
    }

    fn options() -> QueryOptions {
        QueryOptions::builder()
            .with_max_degree_of_parallelism(1)
            .build()
    }

    #[tokio::test]
    async fn direct_pages_stream_through() {
        let transport = ScriptedTransport::new(vec![
            Ok(QueryResponse::new(vec![json!(1)], Some("g1".into()))),
            Ok(QueryResponse::new(vec![json!(2)], None)),
        ]);
        let pages: Vec<_> = executor(transport.clone(), options()).into_stream().collect().await;
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].as_ref().unwrap().continuation(), Some("g1"));

        let requests = transport.requests.lock().unwrap();
        assert!(requests.iter().all(|r| r.pkrange_id.is_none()));
        assert_eq!(requests[1].continuation.as_deref(), Some("g1"));
    }

    #[tokio::test]
    async fn not_servable_switches_to_the_embedded_plan() {
        let transport = ScriptedTransport::new(vec![
            not_servable(Some(r#"{"queryInfo":{},"queryRanges":[]}"#)),
            Ok(QueryResponse::new(vec![json!(1)], None)),
            Ok(QueryResponse::new(vec![json!(2)], None)),
        ]);
        let pages: Vec<_> = executor(transport.clone(), options()).into_stream().collect().await;
        let items: Vec<_> = pages
            .into_iter()
            .flat_map(|p| p.unwrap().into_items())
            .collect();
        assert_eq!(items, [json!(1), json!(2)]);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].pkrange_id.as_ref().map(|id| id.value()), Some("0"));
        assert_eq!(requests[2].pkrange_id.as_ref().map(|id| id.value()), Some("1"));
    }

    #[tokio::test]
    async fn missing_embedded_plan_falls_back_to_a_plan_request() {
        let transport = ScriptedTransport::new(vec![
            not_servable(None),
            Ok(QueryResponse::new(vec![json!(1)], None)),
            Ok(QueryResponse::new(vec![], None)),
        ]);
        let pages: Vec<_> = executor(transport, options()).into_stream().collect().await;
        assert_eq!(pages.len(), 1);
        assert!(pages[0].is_ok());
    }

    #[tokio::test]
    async fn disabled_cross_partition_fails_after_replan() {
        let transport = ScriptedTransport::new(vec![not_servable(Some("{}"))]);
        let options = QueryOptions::builder().with_cross_partition_query(false).build();
        let pages: Vec<_> = executor(transport.clone(), options).into_stream().collect().await;
        assert_eq!(pages.len(), 1);
        assert!(matches!(pages[0], Err(Error::Validation(_))));
        assert_eq!(transport.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn other_errors_end_the_stream() {
        let transport = ScriptedTransport::new(vec![Err(HttpError::new(StatusCode::NotFound).into())]);
        let pages: Vec<_> = executor(transport, options()).into_stream().collect().await;
        assert_eq!(pages.len(), 1);
        assert_eq!(
            pages[0].as_ref().err().and_then(Error::http_status),
            Some(StatusCode::NotFound)
        );
    }

    #[tokio::test]
    async fn backend_token_cannot_resume_a_supplied_plan() {
        let transport = ScriptedTransport::new(vec![]);
        let options = QueryOptions::builder().with_continuation("+RID:abc").build();
        let pages: Vec<_> = executor(transport, options)
            .with_plan(QueryPlan::default())
            .into_stream()
            .collect()
            .await;
        assert!(matches!(
            pages[0],
            Err(Error::InvalidContinuation {
                layer: TokenLayer::Envelope,
                ..
            })
        ));
    }
}
