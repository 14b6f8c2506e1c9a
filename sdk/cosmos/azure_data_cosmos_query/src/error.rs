// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! Error types for cross-partition query execution.

use std::{fmt, time::Duration};

use azure_core::http::StatusCode;
use serde::Deserialize;

use crate::{
    constants::sub_status,
    models::QueryPlan,
    PartitionKeyRangeId,
};

/// A specialized [`Result`](std::result::Result) for query operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while executing a query.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The service returned an error response.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// A continuation token could not be parsed.
    #[error("invalid {layer} continuation token: {message}")]
    InvalidContinuation { layer: TokenLayer, message: String },

    /// The request or its inputs are invalid. These are never retried.
    #[error("{0}")]
    Validation(String),

    /// The retry policy gave up.
    #[error("request failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A split was signalled, but the directory returned no successor ranges.
    #[error("partition key range '{0}' could not be resolved")]
    UnresolvablePartitionRange(PartitionKeyRangeId),

    /// The transport failed before a response was received.
    #[error("transport error: {0}")]
    Io(String),

    /// The service returned a response the pipeline could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A pipeline component was used out of order.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    pub(crate) fn invalid_continuation(layer: TokenLayer, message: impl Into<String>) -> Self {
        Error::InvalidContinuation {
            layer,
            message: message.into(),
        }
    }

    /// Returns the underlying [`HttpError`], if this error came from a service response.
    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            Error::Http(e) => Some(e),
            Error::RetriesExhausted { source, .. } => source.as_http(),
            _ => None,
        }
    }

    /// Returns the HTTP status code of the service response, if any.
    pub fn http_status(&self) -> Option<StatusCode> {
        self.as_http().map(HttpError::status)
    }
}

/// The layer of a nested continuation token that failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenLayer {
    /// The outer `{"kind": ...}` wrapper.
    Envelope,
    Composite,
    OrderBy,
    Take,
}

impl fmt::Display for TokenLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenLayer::Envelope => f.write_str("envelope"),
            TokenLayer::Composite => f.write_str("composite"),
            TokenLayer::OrderBy => f.write_str("order-by"),
            TokenLayer::Take => f.write_str("take"),
        }
    }
}

/// An error response returned by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpError {
    status: StatusCode,
    sub_status: Option<u32>,
    message: Option<String>,
    body: Option<String>,
    retry_after: Option<Duration>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    message: Option<String>,
    additional_error_info: Option<String>,
}

impl HttpError {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            sub_status: None,
            message: None,
            body: None,
            retry_after: None,
        }
    }

    pub fn with_sub_status(mut self, sub_status: u32) -> Self {
        self.sub_status = Some(sub_status);
        self
    }

    /// Attaches the raw response body. The error message is read from its `message` field when present.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        if let Ok(parsed) = serde_json::from_str::<ErrorBody>(&body) {
            self.message = parsed.message;
        }
        self.body = Some(body);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn sub_status(&self) -> Option<u32> {
        self.sub_status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// The service-suggested delay before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Whether the partition key range the request targeted no longer exists (split or migration).
    pub fn is_partition_gone(&self) -> bool {
        self.status == StatusCode::Gone
            && matches!(
                self.sub_status,
                Some(
                    sub_status::PARTITION_KEY_RANGE_GONE
                        | sub_status::COMPLETING_SPLIT
                        | sub_status::COMPLETING_PARTITION_MIGRATION
                )
            )
    }

    /// Whether the gateway refused to run the query as a single request.
    pub fn is_cross_partition_not_servable(&self) -> bool {
        self.status == StatusCode::BadRequest
            && self.sub_status == Some(sub_status::CROSS_PARTITION_QUERY_NOT_SERVABLE)
    }

    /// Extracts the query plan the gateway embeds in a "cross partition query not servable" response.
    ///
    /// Returns `Ok(None)` if the body carries no plan.
    pub fn query_plan(&self) -> Result<Option<QueryPlan>> {
        let Some(body) = self.body.as_deref() else {
            return Ok(None);
        };
        let parsed: ErrorBody = serde_json::from_str(body)?;
        match parsed.additional_error_info {
            Some(info) => Ok(Some(serde_json::from_str(&info)?)),
            None => Ok(None),
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request failed with status {}", u16::from(self.status))?;
        if let Some(sub_status) = self.sub_status {
            write!(f, " (sub-status {})", sub_status)?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for HttpError {}

impl From<Error> for azure_core::Error {
    fn from(error: Error) -> Self {
        azure_core::Error::full(
            azure_core::error::ErrorKind::Other,
            error,
            "cross-partition query failed",
        )
    }
}

/// How the pipeline should react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; the retry policy may try the same request again.
    Retryable,
    /// The partition key range split or moved; resolve its successors.
    PartitionGone,
    /// The gateway cannot serve the query directly; fetch a plan and fan out.
    NeedsReplan,
    /// Neither retrying nor re-planning will help.
    Fatal,
}

/// Classifies an error into the action the pipeline takes for it.
pub fn classify(error: &Error) -> ErrorClass {
    match error {
        Error::Http(e) if e.is_partition_gone() => ErrorClass::PartitionGone,
        Error::Http(e) if e.is_cross_partition_not_servable() => ErrorClass::NeedsReplan,
        Error::Http(e)
            if matches!(
                e.status(),
                StatusCode::TooManyRequests
                    | StatusCode::RequestTimeout
                    | StatusCode::ServiceUnavailable
            ) =>
        {
            ErrorClass::Retryable
        }
        Error::Io(_) => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_gone_sub_statuses() {
        for sub in [1002, 1007, 1008] {
            let err = Error::from(HttpError::new(StatusCode::Gone).with_sub_status(sub));
            assert_eq!(classify(&err), ErrorClass::PartitionGone);
        }

        // A 410 without a partition sub-status is not a split.
        let err = Error::from(HttpError::new(StatusCode::Gone).with_sub_status(1000));
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }

    #[test]
    fn classifies_replan_and_retryable() {
        let err = Error::from(HttpError::new(StatusCode::BadRequest).with_sub_status(1004));
        assert_eq!(classify(&err), ErrorClass::NeedsReplan);

        let err = Error::from(HttpError::new(StatusCode::BadRequest));
        assert_eq!(classify(&err), ErrorClass::Fatal);

        assert_eq!(
            classify(&Error::from(HttpError::new(StatusCode::TooManyRequests))),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(&Error::Io("connection reset".into())),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(&Error::Validation("bad".into())),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn reads_message_and_plan_from_body() {
        let plan = serde_json::json!({
            "partitionedQueryExecutionInfoVersion": 2,
            "queryInfo": { "orderBy": ["Ascending"], "top": 5 },
            "queryRanges": [{ "min": "", "max": "FF", "isMinInclusive": true, "isMaxInclusive": false }],
        });
        let body = serde_json::json!({
            "code": "BadRequest",
            "message": "The provided cross partition query can not be directly served by the gateway.",
            "additionalErrorInfo": plan.to_string(),
        });
        let err = HttpError::new(StatusCode::BadRequest)
            .with_sub_status(1004)
            .with_body(body.to_string());

        assert!(err
            .error_message()
            .unwrap()
            .starts_with("The provided cross partition query"));
        let plan = err.query_plan().unwrap().unwrap();
        assert!(plan.has_order_by());
        assert_eq!(plan.query_info.top, Some(5));
    }

    #[test]
    fn missing_plan_is_none() {
        let err = HttpError::new(StatusCode::BadRequest).with_body(r#"{"message":"nope"}"#);
        assert!(err.query_plan().unwrap().is_none());
        assert!(HttpError::new(StatusCode::BadRequest).query_plan().unwrap().is_none());
    }

    #[test]
    fn exhausted_retries_expose_the_http_status() {
        let err = Error::RetriesExhausted {
            attempts: 3,
            source: Box::new(HttpError::new(StatusCode::TooManyRequests).into()),
        };
        assert_eq!(err.http_status(), Some(StatusCode::TooManyRequests));
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }

    #[test]
    fn converts_to_azure_core_error() {
        let err = Error::from(HttpError::new(StatusCode::Gone).with_sub_status(1002));
        let core_error: azure_core::Error = err.into();
        assert!(matches!(
            core_error.kind(),
            azure_core::error::ErrorKind::Other
        ));
    }

    #[test]
    fn unknown_status_codes_round_trip() {
        let err = HttpError::new(StatusCode::from(449u16)).with_sub_status(0);
        assert_eq!(u16::from(err.status()), 449);
        assert_eq!(err.to_string(), "request failed with status 449 (sub-status 0)");
    }

    #[test]
    fn display_names_the_token_layer() {
        let err = Error::invalid_continuation(TokenLayer::OrderBy, "missing rid");
        assert_eq!(
            err.to_string(),
            "invalid order-by continuation token: missing rid"
        );
    }
}
