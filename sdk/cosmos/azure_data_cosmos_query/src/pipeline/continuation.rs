// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! Client-side continuation tokens for cross-partition queries.
//!
//! A token is a JSON object with a `kind` discriminant:
//!
//! * `{"kind":"composite","ranges":[...]}` resumes an unordered fan-out, one entry per partition key range.
//! * `{"kind":"orderBy","ranges":[...]}` resumes an `ORDER BY` merge.
//! * `{"kind":"take","remainingCount":n,"sourceToken":"..."}` wraps either of the above for `TOP` queries.
//!
//! Callers must treat tokens as opaque strings.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    error::TokenLayer,
    models::{KeyRange, PartitionKeyRange},
    Error, PartitionKeyRangeId,
};

/// A decoded client-side continuation token.
#[derive(Clone, Debug, PartialEq)]
pub enum ContinuationToken {
    Composite(Vec<CompositeContinuationToken>),
    OrderBy(Vec<OrderByContinuationToken>),
    Take(TakeContinuationToken),
}

/// The identity and bounds of the partition key range a token entry belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
    pub id: PartitionKeyRangeId,
    pub min: String,
    pub max: String,
}

impl TokenRange {
    pub fn key_range(&self) -> KeyRange {
        KeyRange::new(self.min.clone(), self.max.clone())
    }

    pub fn to_partition_key_range(&self) -> PartitionKeyRange {
        PartitionKeyRange::new(self.id.clone(), self.min.clone(), self.max.clone())
    }
}

impl From<&PartitionKeyRange> for TokenRange {
    fn from(range: &PartitionKeyRange) -> Self {
        Self {
            id: range.id.clone(),
            min: range.min_inclusive.clone(),
            max: range.max_exclusive.clone(),
        }
    }
}

/// The resumption point of a single partition key range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositeContinuationToken {
    /// The backend continuation for this range. `None` with `done == false` means "start from the beginning".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    pub range: TokenRange,

    /// Set once the range has been fully drained.
    #[serde(default, skip_serializing_if = "is_false")]
    pub done: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One sort key value. A missing `item` means the value was undefined, which sorts before `null`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderByItem {
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub item: Option<Value>,
}

fn deserialize_present<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// The resumption point of one range of an `ORDER BY` merge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderByContinuationToken {
    pub composite_token: CompositeContinuationToken,

    /// Sort key values of the last item the merge emitted.
    pub order_by_items: Vec<OrderByItem>,

    /// Resource id of the last item the merge emitted.
    pub rid: String,

    /// When set, the item identified by `order_by_items` and `rid` is emitted again on resume.
    #[serde(default)]
    pub inclusive: bool,
}

/// Tracks how many more items a `TOP` query may emit.
#[derive(Clone, Debug, PartialEq)]
pub struct TakeContinuationToken {
    pub remaining_count: u64,
    pub source: Box<ContinuationToken>,
}

#[derive(Serialize)]
#[serde(tag = "kind")]
enum Wire<'a> {
    #[serde(rename = "composite")]
    Composite {
        ranges: &'a [CompositeContinuationToken],
    },
    #[serde(rename = "orderBy")]
    OrderBy {
        ranges: &'a [OrderByContinuationToken],
    },
    #[serde(rename = "take")]
    Take {
        #[serde(rename = "remainingCount")]
        remaining_count: u64,
        #[serde(rename = "sourceToken")]
        source_token: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TakeWire {
    remaining_count: u64,
    source_token: String,
}

impl ContinuationToken {
    /// Encodes the token as an opaque string.
    pub fn encode(&self) -> crate::Result<String> {
        let wire = match self {
            ContinuationToken::Composite(ranges) => Wire::Composite { ranges },
            ContinuationToken::OrderBy(ranges) => Wire::OrderBy { ranges },
            ContinuationToken::Take(take) => Wire::Take {
                remaining_count: take.remaining_count,
                source_token: take.source.encode()?,
            },
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Decodes a token produced by [`encode`](Self::encode).
    ///
    /// Errors name the layer that failed, so that a corrupted `TOP` token over an `ORDER BY`
    /// query reports whether the take wrapper or the order-by entries are broken.
    pub fn decode(token: &str) -> crate::Result<Self> {
        let value: Value = serde_json::from_str(token)
            .map_err(|e| Error::invalid_continuation(TokenLayer::Envelope, e.to_string()))?;
        Self::decode_value(value)
    }

    /// Distinguishes client-side tokens from backend continuations.
    ///
    /// Returns `Ok(None)` for anything that is not a JSON object with a `kind` field, which is
    /// passed to the service as-is. Anything that claims to be a client-side token must decode.
    pub fn sniff(token: &str) -> crate::Result<Option<Self>> {
        match serde_json::from_str::<Value>(token) {
            Ok(value @ Value::Object(_)) if value.get("kind").is_some() => {
                Self::decode_value(value).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn decode_value(value: Value) -> crate::Result<Self> {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_continuation(TokenLayer::Envelope, "missing 'kind'"))?
            .to_owned();

        match kind.as_str() {
            "composite" => {
                let ranges: Vec<CompositeContinuationToken> = field(&value, "ranges")
                    .and_then(|v| serde_json::from_value(v).map_err(|e| e.to_string()))
                    .map_err(|e| Error::invalid_continuation(TokenLayer::Composite, e))?;
                validate_composites(ranges.iter(), TokenLayer::Composite)?;
                Ok(ContinuationToken::Composite(ranges))
            }
            "orderBy" => {
                let ranges: Vec<OrderByContinuationToken> = field(&value, "ranges")
                    .and_then(|v| serde_json::from_value(v).map_err(|e| e.to_string()))
                    .map_err(|e| Error::invalid_continuation(TokenLayer::OrderBy, e))?;
                validate_composites(ranges.iter().map(|r| &r.composite_token), TokenLayer::OrderBy)?;
                if let Some(empty) = ranges.iter().find(|r| r.rid.is_empty()) {
                    return Err(Error::invalid_continuation(
                        TokenLayer::OrderBy,
                        format!("range '{}' has an empty rid", empty.composite_token.range.id),
                    ));
                }
                Ok(ContinuationToken::OrderBy(ranges))
            }
            "take" => {
                let wire: TakeWire = serde_json::from_value(value)
                    .map_err(|e| Error::invalid_continuation(TokenLayer::Take, e.to_string()))?;
                let source = ContinuationToken::decode(&wire.source_token).map_err(|e| match e {
                    Error::InvalidContinuation {
                        layer: TokenLayer::Envelope,
                        message,
                    } => Error::invalid_continuation(
                        TokenLayer::Take,
                        format!("sourceToken is not a continuation token: {}", message),
                    ),
                    other => other,
                })?;
                Ok(ContinuationToken::Take(TakeContinuationToken {
                    remaining_count: wire.remaining_count,
                    source: Box::new(source),
                }))
            }
            other => Err(Error::invalid_continuation(
                TokenLayer::Envelope,
                format!("unknown kind '{}'", other),
            )),
        }
    }
}

fn field(value: &Value, name: &str) -> Result<Value, String> {
    value
        .get(name)
        .cloned()
        .ok_or_else(|| format!("missing '{}'", name))
}

/// Checks that entries are non-empty, have range ids, and do not overlap.
fn validate_composites<'a>(
    entries: impl Iterator<Item = &'a CompositeContinuationToken>,
    layer: TokenLayer,
) -> crate::Result<()> {
    let mut ranges: Vec<&TokenRange> = entries.map(|e| &e.range).collect();
    if ranges.is_empty() {
        return Err(Error::invalid_continuation(layer, "no ranges"));
    }
    if ranges.iter().any(|r| r.id.value().is_empty()) {
        return Err(Error::invalid_continuation(layer, "empty range id"));
    }
    ranges.sort_by(|a, b| a.min.cmp(&b.min));
    for pair in ranges.windows(2) {
        if pair[1].min < pair[0].max {
            return Err(Error::invalid_continuation(
                layer,
                format!("ranges '{}' and '{}' overlap", pair[0].id, pair[1].id),
            ));
        }
    }
    Ok(())
}
