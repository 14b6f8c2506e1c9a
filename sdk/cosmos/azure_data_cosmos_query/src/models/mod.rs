// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! Model types used by the query pipeline.

mod document_rid;
mod partition_key_range;
mod query_page;
mod query_plan;

pub use document_rid::*;
pub use partition_key_range::*;
pub use query_page::*;
pub use query_plan::*;
