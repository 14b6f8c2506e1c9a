// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::Error;

/// The parsed resource ID (`_rid`) of a document.
///
/// Document rids are 16 bytes encoded as base64, with `-` standing in for `/`:
/// database (u32 LE), collection (u32 LE), document (u64 LE).
/// They order by `(database, collection, document)`, which is the tie-break order for `ORDER BY` merges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentRid {
    database: u32,
    collection: u32,
    document: u64,
}

const RID_LEN: usize = 16;

impl DocumentRid {
    pub fn new(database: u32, collection: u32, document: u64) -> Self {
        Self {
            database,
            collection,
            document,
        }
    }

    pub fn document(&self) -> u64 {
        self.document
    }
}

impl FromStr for DocumentRid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || Error::Validation(format!("malformed resource id '{}'", s));
        if s.is_empty() {
            return Err(malformed());
        }

        let bytes = STANDARD
            .decode(s.replace('-', "/"))
            .map_err(|_| malformed())?;
        let bytes: [u8; RID_LEN] = bytes.try_into().map_err(|_| malformed())?;

        let mut database = [0u8; 4];
        let mut collection = [0u8; 4];
        let mut document = [0u8; 8];
        database.copy_from_slice(&bytes[0..4]);
        collection.copy_from_slice(&bytes[4..8]);
        document.copy_from_slice(&bytes[8..16]);

        Ok(Self {
            database: u32::from_le_bytes(database),
            collection: u32::from_le_bytes(collection),
            document: u64::from_le_bytes(document),
        })
    }
}

impl fmt::Display for DocumentRid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = [0u8; RID_LEN];
        bytes[0..4].copy_from_slice(&self.database.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.collection.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.document.to_le_bytes());
        f.write_str(&STANDARD.encode(bytes).replace('/', "-"))
    }
}
