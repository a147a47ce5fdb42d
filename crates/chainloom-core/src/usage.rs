use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Token counts reported by a provider for one call, or accumulated over
/// several. Addition treats a missing count as the identity, so
/// `None + Some(n) == Some(n)`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
    /// Provider-specific counters (cache reads, reasoning tokens, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub raw: Map<String, Value>,
}

impl TokenUsage {
    pub fn new(input: Option<u64>, output: Option<u64>) -> Self {
        Self {
            input,
            output,
            raw: Map::new(),
        }
    }

    pub fn with_raw(mut self, raw: Map<String, Value>) -> Self {
        self.raw = raw;
        self
    }

    pub fn total(&self) -> u64 {
        self.input.unwrap_or(0).saturating_add(self.output.unwrap_or(0))
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none() && self.raw.is_empty()
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(mut self, rhs: TokenUsage) -> TokenUsage {
        self += rhs;
        self
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        self.input = add_counts(self.input, rhs.input);
        self.output = add_counts(self.output, rhs.output);
        merge_raw(&mut self.raw, rhs.raw);
    }
}

/// Add two optional usages, where an absent side is the identity.
pub fn add_usage(a: Option<TokenUsage>, b: Option<TokenUsage>) -> Option<TokenUsage> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, None) => a,
        (None, b) => b,
    }
}

fn add_counts(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.saturating_add(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Numeric values are summed, nested objects merged recursively, anything
/// else takes the later value.
fn merge_raw(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, incoming) in source {
        let merged = match target.remove(&key) {
            Some(existing) => merge_raw_value(existing, incoming),
            None => incoming,
        };
        target.insert(key, merged);
    }
}

fn merge_raw_value(existing: Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::Number(a), Value::Number(b)) => Value::Number(sum_numbers(&a, &b).unwrap_or(b)),
        (Value::Object(mut a), Value::Object(b)) => {
            merge_raw(&mut a, b);
            Value::Object(a)
        }
        (_, incoming) => incoming,
    }
}

fn sum_numbers(a: &Number, b: &Number) -> Option<Number> {
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.checked_add(y).map(Number::from);
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.checked_add(y).map(Number::from);
    }
    Number::from_f64(a.as_f64()? + b.as_f64()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn none_is_identity() {
        let a = TokenUsage::new(None, Some(3));
        let b = TokenUsage::new(Some(10), None);
        let sum = a + b;
        assert_eq!(sum.input, Some(10));
        assert_eq!(sum.output, Some(3));
    }

    #[test]
    fn total_saturates() {
        assert_eq!(TokenUsage::new(Some(u64::MAX), Some(1)).total(), u64::MAX);
        assert_eq!(TokenUsage::new(Some(u64::MAX - 1), None).total(), u64::MAX - 1);
        assert_eq!(TokenUsage::new(Some(7), Some(5)).total(), 12);
    }

    #[test]
    fn counts_are_summed() {
        let sum = TokenUsage::new(Some(10), Some(2)) + TokenUsage::new(Some(5), Some(8));
        assert_eq!(sum.input, Some(15));
        assert_eq!(sum.output, Some(10));
        assert_eq!(sum.total(), 25);
    }

    #[test]
    fn raw_numeric_keys_are_summed() {
        let a = TokenUsage::default().with_raw(raw(json!({"cache_read": 100, "ratio": 0.5})));
        let b = TokenUsage::default().with_raw(raw(json!({"cache_read": 20, "ratio": 0.25})));
        let sum = a + b;
        assert_eq!(sum.raw["cache_read"], json!(120));
        assert_eq!(sum.raw["ratio"], json!(0.75));
    }

    #[test]
    fn raw_non_numeric_keys_take_later_value() {
        let a = TokenUsage::default().with_raw(raw(json!({"tier": "standard", "n": 1})));
        let b = TokenUsage::default().with_raw(raw(json!({"tier": "priority", "n": "x"})));
        let sum = a + b;
        assert_eq!(sum.raw["tier"], json!("priority"));
        assert_eq!(sum.raw["n"], json!("x"));
    }

    #[test]
    fn raw_nested_objects_merge() {
        let a = TokenUsage::default().with_raw(raw(json!({"details": {"reasoning": 4}})));
        let b = TokenUsage::default().with_raw(raw(json!({"details": {"reasoning": 6, "audio": 1}})));
        let sum = a + b;
        assert_eq!(sum.raw["details"], json!({"reasoning": 10, "audio": 1}));
    }

    #[test]
    fn add_usage_optional() {
        assert_eq!(add_usage(None, None), None);
        let u = TokenUsage::new(Some(1), Some(1));
        assert_eq!(add_usage(None, Some(u.clone())), Some(u.clone()));
        assert_eq!(add_usage(Some(u.clone()), None), Some(u.clone()));
        assert_eq!(add_usage(Some(u.clone()), Some(u)).and_then(|u| u.input), Some(2));
    }

    #[test]
    fn serde_skips_absent_fields() {
        let json = serde_json::to_value(TokenUsage::new(Some(7), None)).unwrap();
        assert_eq!(json, json!({"input": 7}));
        let parsed: TokenUsage = serde_json::from_value(json!({"output": 2})).unwrap();
        assert_eq!(parsed, TokenUsage::new(None, Some(2)));
    }
}
