//! Payload truncation
//!
//! Keeps every stored record under a byte ceiling. The bytes left after the
//! fixed part of a record are shared between its payload fields: fields under
//! their fair share keep everything, the rest split what remains equally.
//! A field over its budget is shrunk step by step:
//!
//! 1. long strings inside it are cut and suffixed with
//!    `... [truncated, was N chars]`, tightening the cut until it fits;
//! 2. failing that, the field is replaced by
//!    `{"_truncated": true, "_original_size": N, "preview": "..."}`.
//!
//! Objects that survive step 1 carry `"_truncated": true`. When not even the
//! preview fits, a bare `{"_truncated": true}` or `{}` is stored, and a budget
//! too small for `{}` is a validation error.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::models::{Span, Trace};

/// Longest string kept on the first shrinking pass, in chars
const FIRST_STRING_CUT: usize = 1000;

/// Below this, string shrinking gives up and the preview form is used
const LAST_STRING_CUT: usize = 16;

/// A payload slot of a record
pub enum PayloadSlot<'a> {
    /// Structured JSON payload
    Json(&'a mut Value),
    /// Free-text payload
    Text(&'a mut Option<String>),
}

impl PayloadSlot<'_> {
    fn encoded_len(&self) -> Result<usize> {
        match self {
            Self::Json(value) => encoded_len(&**value),
            Self::Text(text) => encoded_len(&**text),
        }
    }

    fn fit(&mut self, budget: usize) -> Result<()> {
        match self {
            Self::Json(value) => {
                let fitted = fit_json(value, budget)?;
                **value = fitted;
            }
            Self::Text(text) => {
                if let Some(current) = text.as_deref() {
                    let fitted = fit_text(current, budget)?;
                    **text = Some(fitted);
                }
            }
        }
        Ok(())
    }
}

/// A record whose payload fields may be shortened to respect a size ceiling
pub trait Truncatable: Serialize {
    /// The payload fields, by name
    fn payload_slots(&mut self) -> Vec<(&'static str, PayloadSlot<'_>)>;
}

impl Truncatable for Span {
    fn payload_slots(&mut self) -> Vec<(&'static str, PayloadSlot<'_>)> {
        vec![
            ("input_data", PayloadSlot::Json(&mut self.input_data)),
            ("output_data", PayloadSlot::Json(&mut self.output_data)),
            ("metadata", PayloadSlot::Json(&mut self.metadata)),
        ]
    }
}

impl Truncatable for Trace {
    fn payload_slots(&mut self) -> Vec<(&'static str, PayloadSlot<'_>)> {
        vec![
            ("metadata", PayloadSlot::Json(&mut self.metadata)),
            ("output", PayloadSlot::Text(&mut self.output)),
        ]
    }
}

/// Shrink the payload fields of `record` until it serializes to at most
/// `max_bytes`. Returns the names of the fields that were shortened.
pub fn enforce_record_limit<R: Truncatable>(
    record: &mut R,
    max_bytes: usize,
) -> Result<Vec<&'static str>> {
    let total = encoded_len(&*record)?;
    if total <= max_bytes {
        return Ok(Vec::new());
    }

    let mut slots = record.payload_slots();
    let sizes = slots
        .iter()
        .map(|(_, slot)| slot.encoded_len())
        .collect::<Result<Vec<_>>>()?;
    let fixed = total - sizes.iter().sum::<usize>();
    let available = max_bytes
        .checked_sub(fixed)
        .ok_or_else(|| Error::validation(format!(
            "record exceeds {max_bytes} bytes before any payload is stored"
        )))?;

    let budgets = share_budget(&sizes, available);
    let mut truncated = Vec::new();
    for ((name, slot), (size, budget)) in slots.iter_mut().zip(sizes.iter().zip(budgets)) {
        if *size > budget {
            slot.fit(budget)?;
            truncated.push(*name);
        }
    }
    Ok(truncated)
}

/// Water-filling split of `available` bytes among fields of the given sizes
pub fn share_budget(sizes: &[usize], available: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.sort_by_key(|&i| sizes[i]);

    let mut budgets = vec![0; sizes.len()];
    let mut remaining = available;
    for (position, &i) in order.iter().enumerate() {
        let share = remaining / (sizes.len() - position);
        if sizes[i] <= share {
            budgets[i] = sizes[i];
            remaining -= sizes[i];
        } else {
            // every field from here on is at least this large
            for &j in &order[position..] {
                budgets[j] = share;
            }
            break;
        }
    }
    budgets
}

/// Cap an error message at `max_chars` characters
pub fn cap_error(error: Option<String>, max_chars: usize) -> Option<String> {
    let error = error?;
    let total = error.chars().count();
    if total <= max_chars {
        return Some(error);
    }
    let keep: String = error.chars().take(max_chars.saturating_sub(50)).collect();
    Some(format!("{keep}\n... [truncated, was {total} chars]"))
}

/// Serialized size of a value in bytes
pub fn encoded_len<T: Serialize + ?Sized>(value: &T) -> Result<usize> {
    Ok(serde_json::to_vec(value)?.len())
}

fn fit_json(value: &Value, budget: usize) -> Result<Value> {
    let original = serde_json::to_string(value)?;
    if original.len() <= budget {
        return Ok(value.clone());
    }

    if value.is_object() {
        let mut cut = FIRST_STRING_CUT;
        while cut >= LAST_STRING_CUT {
            let mut candidate = shorten_strings(value, cut);
            if let Value::Object(map) = &mut candidate {
                map.insert("_truncated".to_string(), Value::Bool(true));
            }
            if encoded_len(&candidate)? <= budget {
                return Ok(candidate);
            }
            cut /= 4;
        }
    }

    preview(&original, budget)
}

fn shorten_strings(value: &Value, cut: usize) -> Value {
    match value {
        Value::String(s) => Value::String(cut_text(s, cut)),
        Value::Array(items) => Value::Array(items.iter().map(|v| shorten_strings(v, cut)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), shorten_strings(v, cut)))
                .collect::<Map<_, _>>(),
        ),
        other => other.clone(),
    }
}

fn cut_text(s: &str, keep: usize) -> String {
    let total = s.chars().count();
    if total <= keep {
        return s.to_string();
    }
    let head: String = s.chars().take(keep).collect();
    format!("{head}... [truncated, was {total} chars]")
}

fn preview(serialized: &str, budget: usize) -> Result<Value> {
    let original_size = serialized.len();
    let mut keep = budget.min(original_size);
    loop {
        let end = floor_char_boundary(serialized, keep);
        let candidate = json!({
            "_truncated": true,
            "_original_size": original_size,
            "preview": &serialized[..end],
        });
        let len = encoded_len(&candidate)?;
        if len <= budget {
            return Ok(candidate);
        }
        if end == 0 {
            return bare_marker(budget);
        }
        keep = (end * budget / len).min(end - 1);
    }
}

fn bare_marker(budget: usize) -> Result<Value> {
    for candidate in [json!({ "_truncated": true }), json!({})] {
        if encoded_len(&candidate)? <= budget {
            return Ok(candidate);
        }
    }
    Err(too_small(budget))
}

fn too_small(budget: usize) -> Error {
    Error::validation(format!("payload field cannot be stored in {budget} bytes"))
}

fn fit_text(text: &str, budget: usize) -> Result<String> {
    if encoded_len(text)? <= budget {
        return Ok(text.to_string());
    }
    let mut keep = budget.min(text.chars().count());
    loop {
        let candidate = cut_text(text, keep);
        let len = encoded_len(&candidate)?;
        if len <= budget {
            return Ok(candidate);
        }
        if keep == 0 {
            return if encoded_len("")? <= budget {
                Ok(String::new())
            } else {
                Err(too_small(budget))
            };
        }
        keep = (keep * budget / len).min(keep - 1);
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SpanType;
    use chrono::{Duration, Utc};
    use rstest::rstest;

    fn span_with_output(output: Value) -> Span {
        let mut span = Span::new("s1", "t1", "call", SpanType::Llm, Utc::now(), Duration::days(90));
        span.output_data = output;
        span
    }

    #[rstest]
    #[case(&[10, 20, 30], 100, &[10, 20, 30])]
    #[case(&[10, 500, 900], 310, &[10, 150, 150])]
    #[case(&[400, 400], 300, &[150, 150])]
    #[case(&[0, 1000, 5], 65, &[0, 60, 5])]
    fn shares_space_water_filling_style(
        #[case] sizes: &[usize],
        #[case] available: usize,
        #[case] expected: &[usize],
    ) {
        assert_eq!(share_budget(sizes, available), expected);
    }

    #[test]
    fn small_records_are_left_alone() {
        let mut span = span_with_output(json!({"answer": "short"}));
        let before = span.clone();
        assert!(enforce_record_limit(&mut span, 400_000).unwrap().is_empty());
        assert_eq!(span, before);
    }

    #[test]
    fn oversized_output_is_truncated_and_marked() {
        let mut span = span_with_output(json!({"text": "x".repeat(10_000_000)}));
        let truncated = enforce_record_limit(&mut span, 400_000).unwrap();

        assert_eq!(truncated, vec!["output_data"]);
        assert!(encoded_len(&span).unwrap() <= 400_000);
        assert_eq!(span.output_data["_truncated"], json!(true));
        let text = span.output_data["text"].as_str().unwrap();
        assert!(text.ends_with("... [truncated, was 10000000 chars]"));
        assert_eq!(span.input_data, json!({}));
    }

    #[test]
    fn many_medium_strings_fall_back_to_preview() {
        let fields: Map<String, Value> = (0..2_000)
            .map(|i| (format!("k{i}"), Value::String("y".repeat(900))))
            .collect();
        let mut span = span_with_output(Value::Object(fields));

        enforce_record_limit(&mut span, 20_000).unwrap();
        assert!(encoded_len(&span).unwrap() <= 20_000);
        assert_eq!(span.output_data["_truncated"], json!(true));
        assert!(span.output_data["_original_size"].as_u64().unwrap() > 1_000_000);
        assert!(span.output_data["preview"].is_string());
    }

    #[test]
    fn large_fields_split_the_space_evenly() {
        let mut span = span_with_output(json!({"out": "o".repeat(300_000)}));
        span.input_data = json!({"in": "i".repeat(300_000)});
        span.metadata = json!({"note": "small"});

        let mut truncated = enforce_record_limit(&mut span, 100_000).unwrap();
        truncated.sort_unstable();
        assert_eq!(truncated, vec!["input_data", "output_data"]);
        assert!(encoded_len(&span).unwrap() <= 100_000);
        assert_eq!(span.metadata, json!({"note": "small"}));
    }

    #[test]
    fn trace_output_text_is_cut_with_marker() {
        let mut trace = Trace::new("t1", "p", "run", Utc::now(), Duration::days(90));
        trace.output = Some("é".repeat(50_000));
        enforce_record_limit(&mut trace, 10_000).unwrap();

        assert!(encoded_len(&trace).unwrap() <= 10_000);
        let output = trace.output.unwrap();
        assert!(output.ends_with("[truncated, was 50000 chars]"));
    }

    #[test]
    fn tiny_budgets_never_overshoot_the_ceiling() {
        let mut base = span_with_output(json!({}));
        let fixed = encoded_len(&base).unwrap() - 3 * "{}".len();
        base.input_data = json!({"in": "i".repeat(1_000)});
        base.output_data = json!({"out": "o".repeat(1_000)});
        base.metadata = json!({"note": "m".repeat(1_000)});

        let mut span = base.clone();
        let limit = fixed + 30;
        enforce_record_limit(&mut span, limit).unwrap();
        assert!(encoded_len(&span).unwrap() <= limit);
        assert_eq!(span.output_data, json!({}));

        let mut span = base.clone();
        let limit = fixed + 3 * 20;
        enforce_record_limit(&mut span, limit).unwrap();
        assert!(encoded_len(&span).unwrap() <= limit);
        assert_eq!(span.output_data, json!({"_truncated": true}));

        let mut span = base;
        let err = enforce_record_limit(&mut span, fixed + 3).unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn preview_never_splits_a_multibyte_char() {
        let value = json!(["ü".repeat(5_000)]);
        let fitted = fit_json(&value, 500).unwrap();
        assert!(encoded_len(&fitted).unwrap() <= 500);
        assert!(fitted["preview"].as_str().is_some());
    }

    #[test]
    fn errors_are_capped_by_chars() {
        assert_eq!(cap_error(None, 10), None);
        assert_eq!(cap_error(Some("boom".into()), 10).as_deref(), Some("boom"));

        let capped = cap_error(Some("e".repeat(20_000)), 10_000).unwrap();
        assert!(capped.chars().count() <= 10_000);
        assert!(capped.ends_with("[truncated, was 20000 chars]"));
    }
}
