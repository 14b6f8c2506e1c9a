// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

#![doc = include_str!("../README.md")]
// Docs.rs build is done with the nightly compiler, so we can enable nightly features in that build.
// In this case we enable two features:
// - `doc_auto_cfg`: Automatically scans `cfg` attributes and uses them to show those required configurations in the generated documentation.
// - `doc_cfg_hide`: Ignore the `doc` configuration for `doc_auto_cfg`.
// See https://doc.rust-lang.org/rustdoc/unstable-features.html#doc_auto_cfg-automatically-generate-doccfg for more details.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(docsrs, feature(doc_cfg_hide))]

pub mod clients;
pub mod constants;
pub mod error;
pub mod models;
mod options;
pub mod pipeline;
mod query;
pub mod retry;
pub mod routing;
pub mod transport;

use std::fmt;

#[doc(inline)]
pub use clients::ContainerClient;

pub use error::{Error, ErrorClass, HttpError, Result, TokenLayer};
pub use options::*;
pub use query::{Query, QueryParameter};

pub use models::{QueryPage, QueryPager};

/// The identifier of a partition key range, as assigned by the service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PartitionKeyRangeId(String);

impl PartitionKeyRangeId {
    /// Creates a new partition key range ID from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the inner string value.
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKeyRangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKeyRangeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The resource identifier (or link) of a collection being queried.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    /// Creates a new resource ID from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the inner string value.
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
