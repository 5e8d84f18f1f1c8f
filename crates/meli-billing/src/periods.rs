//! Billing period listing and selection
//!
//! The periods endpoint is loose about shape: the list may arrive bare or
//! wrapped under `periods`/`results`/`data`, and each entry spells its date
//! fields in one of several ways. [`Period`] absorbs the spellings with
//! serde aliases; [`choose_period`] picks the most recent entry.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// One billing period. All fields optional because the upstream payload is
/// only loosely specified.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Period {
    #[serde(default, alias = "period_key", alias = "id")]
    pub key: Option<String>,
    #[serde(
        default,
        alias = "start_date",
        alias = "date_from",
        alias = "since",
        alias = "period_from"
    )]
    pub from: Option<String>,
    #[serde(
        default,
        alias = "end_date",
        alias = "date_to",
        alias = "until",
        alias = "period_to"
    )]
    pub to: Option<String>,
}

/// Extract the periods list from whichever envelope the API used.
pub fn parse_periods(payload: &Value) -> Vec<Period> {
    let items: Vec<Value> = match payload {
        Value::Array(items) => items.clone(),
        Value::Object(map) => {
            let nested = ["periods", "results", "data"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_array).cloned());
            match nested {
                Some(items) => items,
                // some payloads wrap the list under an arbitrary single key
                None if map.values().all(Value::is_array) => map
                    .values()
                    .next()
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                None => Vec::new(),
            }
        }
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).unwrap_or_default())
        .collect()
}

/// Pick the most recent period and return its key.
///
/// Entries with an explicit end date outrank entries with only a start
/// date, which outrank key-only entries; ties break lexicographically,
/// which works because the dates are ISO-formatted.
pub fn choose_period(periods: &[Period]) -> Result<String> {
    if periods.is_empty() {
        return Err(Error::EmptyResult("periods list is empty".into()));
    }
    let best = periods
        .iter()
        .max_by(|a, b| rank(a).cmp(&rank(b)))
        .ok_or_else(|| Error::EmptyResult("periods list is empty".into()))?;
    best.key
        .as_deref()
        .filter(|k| !k.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| Error::EmptyResult("selected period has no key".into()))
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

fn rank(p: &Period) -> (u8, &str) {
    if let Some(to) = non_empty(&p.to) {
        return (2, to);
    }
    if let Some(from) = non_empty(&p.from) {
        return (1, from);
    }
    (0, non_empty(&p.key).unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn picks_latest_end_date() {
        let payload = json!([
            {"key": "2025-06", "from": "2025-06-01", "to": "2025-06-30"},
            {"key": "2025-08", "from": "2025-08-01", "to": "2025-08-31"},
            {"key": "2025-07", "from": "2025-07-01", "to": "2025-07-31"},
        ]);
        let periods = parse_periods(&payload);
        assert_eq!(choose_period(&periods).unwrap(), "2025-08");
    }

    #[test]
    fn end_date_outranks_start_date_outranks_key() {
        let payload = json!([
            {"key": "zzzz-key-only"},
            {"key": "from-only", "from": "2099-01-01"},
            {"key": "has-to", "to": "2020-01-31"},
        ]);
        let periods = parse_periods(&payload);
        // even an old "to" beats a futuristic "from"
        assert_eq!(choose_period(&periods).unwrap(), "has-to");
    }

    #[test]
    fn accepts_alternate_field_spellings() {
        let payload = json!([
            {"period_key": "P-1", "end_date": "2025-05-31"},
            {"period_key": "P-2", "end_date": "2025-06-30"},
        ]);
        let periods = parse_periods(&payload);
        assert_eq!(choose_period(&periods).unwrap(), "P-2");
    }

    #[test]
    fn blank_fields_rank_as_missing() {
        let payload = json!([
            {"key": "blank-to", "to": ""},
            {"key": "real", "to": "2025-01-31"},
        ]);
        let periods = parse_periods(&payload);
        assert_eq!(choose_period(&periods).unwrap(), "real");
    }

    #[test]
    fn unwraps_results_envelope() {
        let payload = json!({"results": [{"key": "only", "to": "2025-01-31"}]});
        let periods = parse_periods(&payload);
        assert_eq!(choose_period(&periods).unwrap(), "only");
    }

    #[test]
    fn unwraps_single_list_valued_key() {
        let payload = json!({"whatever": [{"key": "k1", "to": "2025-01-31"}]});
        let periods = parse_periods(&payload);
        assert_eq!(choose_period(&periods).unwrap(), "k1");
    }

    #[test]
    fn empty_list_is_empty_result() {
        assert!(matches!(
            choose_period(&[]),
            Err(Error::EmptyResult(_))
        ));
        let periods = parse_periods(&json!({"unexpected": "shape"}));
        assert!(matches!(
            choose_period(&periods),
            Err(Error::EmptyResult(_))
        ));
    }

    #[test]
    fn selected_period_without_key_is_empty_result() {
        let periods = parse_periods(&json!([{"to": "2025-08-31"}]));
        assert!(matches!(
            choose_period(&periods),
            Err(Error::EmptyResult(_))
        ));
    }
}
