// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde_json::Value;

use super::{order_by::compare_values, PageSource};
use crate::{
    models::{AggregateKind, QueryPage},
    Error,
};

/// Running state of one aggregate.
#[derive(Clone, Debug, PartialEq)]
enum Accumulator {
    Count(u64),
    Sum { sum: f64, defined: bool },
    Min(Option<Value>),
    Max(Option<Value>),
    Average { sum: f64, count: u64 },
}

impl Accumulator {
    fn new(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Count => Accumulator::Count(0),
            AggregateKind::Sum => Accumulator::Sum {
                sum: 0.0,
                defined: true,
            },
            AggregateKind::Min => Accumulator::Min(None),
            AggregateKind::Max => Accumulator::Max(None),
            AggregateKind::Average => Accumulator::Average { sum: 0.0, count: 0 },
        }
    }

    /// Folds one partial result. `None` is an undefined partial, such as the result of an empty range.
    fn fold(&mut self, partial: Option<&Value>) -> crate::Result<()> {
        let Some(partial) = partial else {
            return Ok(());
        };
        match self {
            Accumulator::Count(count) => {
                *count += partial.as_u64().ok_or_else(|| unexpected("COUNT", partial))?;
            }
            Accumulator::Sum { sum, defined } => match partial.as_f64() {
                Some(value) => *sum += value,
                None => *defined = false,
            },
            Accumulator::Min(current) => {
                if current
                    .as_ref()
                    .map_or(true, |c| compare_values(Some(partial), Some(c)) == Ordering::Less)
                {
                    *current = Some(partial.clone());
                }
            }
            Accumulator::Max(current) => {
                if current
                    .as_ref()
                    .map_or(true, |c| compare_values(Some(partial), Some(c)) == Ordering::Greater)
                {
                    *current = Some(partial.clone());
                }
            }
            Accumulator::Average { sum, count } => {
                let partial_sum = partial.get("sum").and_then(Value::as_f64);
                let partial_count = partial.get("count").and_then(Value::as_u64);
                match (partial_sum, partial_count) {
                    (Some(s), Some(c)) => {
                        *sum += s;
                        *count += c;
                    }
                    _ => return Err(unexpected("AVG", partial)),
                }
            }
        }
        Ok(())
    }

    /// The final value, or `None` when the aggregate is undefined.
    fn result(&self) -> Option<Value> {
        match self {
            Accumulator::Count(count) => Some(Value::from(*count)),
            Accumulator::Sum { sum, defined } => defined.then(|| number(*sum)),
            Accumulator::Min(value) | Accumulator::Max(value) => value.clone(),
            Accumulator::Average { sum, count } => {
                (*count > 0).then(|| number(*sum / *count as f64))
            }
        }
    }
}

fn unexpected(aggregate: &str, partial: &Value) -> Error {
    Error::InvalidResponse(format!("unexpected {} partial result: {}", aggregate, partial))
}

/// Renders whole numbers as integers, so `SUM` over integers stays an integer.
fn number(value: f64) -> Value {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

/// Folds every partial result of its inner stage into a single page.
///
/// Each inner item must be an array with one `{"item": partial}` entry per aggregate. A missing `item` is an undefined
/// partial and is skipped.
pub struct AggregateStage {
    inner: Box<dyn PageSource>,
    accumulators: Vec<Accumulator>,
    request_charge: f64,
    done: bool,

    /// Set once a page could not be folded. The inner stage has moved past it, so the result would be wrong.
    failed: Option<String>,
}

impl AggregateStage {
    pub fn new(inner: Box<dyn PageSource>, aggregates: &[AggregateKind]) -> Self {
        Self {
            inner,
            accumulators: aggregates.iter().copied().map(Accumulator::new).collect(),
            request_charge: 0.0,
            done: false,
            failed: None,
        }
    }

    fn fold_item(&mut self, item: &Value) -> crate::Result<()> {
        let partials = item
            .as_array()
            .filter(|p| p.len() == self.accumulators.len())
            .ok_or_else(|| {
                Error::InvalidResponse(format!(
                    "expected {} aggregate partial results, found {}",
                    self.accumulators.len(),
                    item
                ))
            })?;
        for (accumulator, partial) in self.accumulators.iter_mut().zip(partials) {
            accumulator.fold(partial.get("item"))?;
        }
        Ok(())
    }

    /// One value for a single aggregate; an array for several, with undefined results as `null`.
    fn result(&self) -> Option<Value> {
        match self.accumulators.as_slice() {
            [single] => single.result(),
            several => Some(Value::Array(
                several
                    .iter()
                    .map(|a| a.result().unwrap_or(Value::Null))
                    .collect(),
            )),
        }
    }
}

#[async_trait]
impl PageSource for AggregateStage {
    async fn next_page(&mut self) -> crate::Result<Option<QueryPage>> {
        if self.done {
            return Ok(None);
        }
        if let Some(message) = &self.failed {
            return Err(Error::InvalidResponse(format!(
                "an earlier aggregate page could not be read: {}",
                message
            )));
        }

        // Errors from the inner stage leave it where it was, so those can be retried.
        while let Some(page) = self.inner.next_page().await? {
            self.request_charge += page.request_charge();
            for item in page.items() {
                if let Err(e) = self.fold_item(item) {
                    tracing::warn!(error = %e, "could not fold aggregate partial result");
                    self.failed = Some(e.to_string());
                    return Err(e);
                }
            }
        }

        self.done = true;
        let result = self.result();
        tracing::debug!(defined = result.is_some(), "aggregated partial results");
        Ok(Some(
            QueryPage::new(result.into_iter().collect(), None)
                .with_request_charge(self.request_charge),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use serde_json::json;

    use super::*;

    struct Pages(VecDeque<QueryPage>);

    #[async_trait]
    impl PageSource for Pages {
        async fn next_page(&mut self) -> crate::Result<Option<QueryPage>> {
            Ok(self.0.pop_front())
        }
    }

    fn partials(pages: Vec<Vec<Value>>) -> Box<dyn PageSource> {
        Box::new(Pages(
            pages
                .into_iter()
                .map(|items| QueryPage::new(items, None).with_request_charge(1.0))
                .collect(),
        ))
    }

    async fn aggregate(kinds: &[AggregateKind], pages: Vec<Vec<Value>>) -> Vec<Value> {
        let mut stage = AggregateStage::new(partials(pages), kinds);
        let page = stage.next_page().await.unwrap().unwrap();
        assert_eq!(page.continuation(), None);
        assert!(stage.next_page().await.unwrap().is_none());
        page.into_items()
    }

    #[tokio::test]
    async fn counts_across_ranges() {
        let items = aggregate(
            &[AggregateKind::Count],
            vec![vec![json!([{"item": 3}])], vec![json!([{"item": 4}]), json!([{"item": 0}])]],
        )
        .await;
        assert_eq!(items, [json!(7)]);
    }

    #[tokio::test]
    async fn sums_and_averages() {
        let sum = aggregate(
            &[AggregateKind::Sum],
            vec![vec![json!([{"item": 1.5}]), json!([{"item": 2.5}]), json!([{}])]],
        )
        .await;
        assert_eq!(sum, [json!(4)]);

        let average = aggregate(
            &[AggregateKind::Average],
            vec![vec![
                json!([{"item": {"sum": 10, "count": 4}}]),
                json!([{"item": {"sum": 5, "count": 1}}]),
            ]],
        )
        .await;
        assert_eq!(average, [json!(3)]);
    }

    #[tokio::test]
    async fn min_and_max_use_type_order() {
        let pages = vec![vec![
            json!([{"item": 3}, {"item": 3}]),
            json!([{"item": "a"}, {"item": "a"}]),
            json!([{"item": null}, {"item": null}]),
        ]];
        let items = aggregate(&[AggregateKind::Min, AggregateKind::Max], pages).await;
        assert_eq!(items, [json!([null, "a"])]);
    }

    #[tokio::test]
    async fn undefined_results_produce_no_item() {
        let average = aggregate(&[AggregateKind::Average], vec![vec![json!([{}])]]).await;
        assert!(average.is_empty());

        let sum = aggregate(&[AggregateKind::Sum], vec![vec![json!([{"item": "x"}])]]).await;
        assert!(sum.is_empty());
    }

    #[tokio::test]
    async fn rejects_malformed_partials() {
        let mut stage = AggregateStage::new(partials(vec![vec![json!({"item": 1})]]), &[AggregateKind::Count]);
        assert!(matches!(
            stage.next_page().await.unwrap_err(),
            Error::InvalidResponse(_)
        ));
    }

    #[tokio::test]
    async fn unreadable_partial_stops_the_aggregate() {
        let mut stage = AggregateStage::new(
            partials(vec![
                vec![json!([{"item": 2}]), json!("not a partial")],
                vec![json!([{"item": 5}])],
            ]),
            &[AggregateKind::Count],
        );

        // Retrying must not report a count that skipped the rest of the failed page.
        for _ in 0..3 {
            let err = stage.next_page().await.unwrap_err();
            assert!(matches!(err, Error::InvalidResponse(_)), "{}", err);
        }
    }
}
