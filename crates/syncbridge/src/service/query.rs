//! Query matching, sorting and paging shared by the provided services.

use std::cmp::Ordering;

use serde_json::Value;

use super::{FindParams, Page, Pagination};
use crate::catalog::Query;

/// Whether every non-`$` field of `query` equals the same field of `record`.
#[must_use]
pub fn matches(record: &Value, query: &Query) -> bool {
    query
        .iter()
        .filter(|(key, _)| !key.starts_with('$'))
        .all(|(key, expected)| record.get(key) == Some(expected))
}

/// Filter, sort and page `records` according to `query`.
#[must_use]
pub fn paginate(
    records: impl IntoIterator<Item = Value>,
    query: &Query,
    params: FindParams,
    pagination: Pagination,
) -> Page {
    let mut values: Vec<Value> = records
        .into_iter()
        .filter(|record| matches(record, query))
        .collect();

    if let Some(Value::Object(sort)) = query.get("$sort") {
        values.sort_by(|a, b| {
            sort.iter()
                .map(|(field, direction)| {
                    let ordering = compare(a.get(field), b.get(field));
                    if as_number(direction).is_some_and(|d| d < 0) {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                })
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }

    let total = values.len();
    let skip = query
        .get("$skip")
        .and_then(as_number)
        .map_or(0, |n| usize::try_from(n).unwrap_or(0));
    let requested = query
        .get("$limit")
        .and_then(as_number)
        .and_then(|n| usize::try_from(n).ok());
    let limit = if params.paginate {
        requested
            .unwrap_or(pagination.default)
            .min(pagination.max)
    } else {
        requested.unwrap_or(total)
    };

    let data = values.into_iter().skip(skip).take(limit).collect();
    Page {
        total,
        limit,
        skip,
        data,
    }
}

fn as_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
