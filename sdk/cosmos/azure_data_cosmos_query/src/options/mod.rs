// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

mod query_options;

pub use query_options::*;
