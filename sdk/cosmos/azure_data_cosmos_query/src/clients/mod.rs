// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! Clients used to run queries against a collection.

mod container_client;

pub use container_client::ContainerClient;
