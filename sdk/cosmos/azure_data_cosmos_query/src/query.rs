// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use serde::{Deserialize, Serialize};

/// A query to execute, with optional parameters.
///
/// Anything that converts into a [`String`] converts into a parameterless [`Query`]:
///
/// ```rust
/// use azure_data_cosmos_query::Query;
///
/// let query = Query::from("SELECT * FROM c WHERE c.age > @age")
///     .with_parameter("@age", 21);
/// assert_eq!(query.text(), "SELECT * FROM c WHERE c.age > @age");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(rename = "query")]
    text: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parameters: Vec<QueryParameter>,
}

/// A named parameter bound into a [`Query`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryParameter {
    pub name: String,
    pub value: serde_json::Value,
}

impl Query {
    /// Adds a parameter to the query.
    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.parameters.push(QueryParameter {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parameters(&self) -> &[QueryParameter] {
        &self.parameters
    }

    /// Returns a copy of this query with the text replaced, keeping the parameters.
    pub(crate) fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: self.parameters.clone(),
        }
    }
}

impl<T: Into<String>> From<T> for Query {
    fn from(value: T) -> Self {
        Self {
            text: value.into(),
            parameters: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_parameters() {
        let query = Query::from("SELECT * FROM c WHERE c.id = @id").with_parameter("@id", "42");
        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "query": "SELECT * FROM c WHERE c.id = @id",
                "parameters": [{ "name": "@id", "value": "42" }],
            })
        );
    }

    #[test]
    fn omits_empty_parameters() {
        let json = serde_json::to_value(Query::from("SELECT * FROM c")).unwrap();
        assert_eq!(json, serde_json::json!({ "query": "SELECT * FROM c" }));
    }

    #[test]
    fn with_text_keeps_parameters() {
        let query = Query::from("a").with_parameter("@p", 1).with_text("b");
        assert_eq!(query.text(), "b");
        assert_eq!(query.parameters().len(), 1);
    }
}
