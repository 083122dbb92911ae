//! Turns raw model output into parsed JSON. Local models wrap their answers
//! in reasoning tags, prose, and code fences, and sometimes emit JSON that is
//! almost but not quite valid; this module isolates the JSON payload and runs
//! a small, ordered repair ladder before giving up.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

static RE_REASONING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<think>.*?</think>|<thinking>.*?</thinking>|<reasoning>.*?</reasoning>|<reflection>.*?</reflection>|<thought>.*?</thought>",
    )
    .unwrap()
});
static RE_DANGLING_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:think|thinking|reasoning|reflection|thought)>.*\z").unwrap()
});
static RE_END_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\|?(end|eos|eot|im_end|endoftext)\|?>").unwrap()
});
static RE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap());
static RE_MARKER_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)BEGIN[ _]JSON\s*(.*?)\s*END[ _]JSON").unwrap());
static RE_TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());

/// Extract a JSON value from raw model output.
///
/// Returns the parsed value together with the list of repairs that were
/// applied to obtain it (empty when the isolated payload parsed strictly).
/// Never panics; unrecoverable input yields `Error::UnparseableResponse`
/// carrying the raw text and the attempted repairs.
pub fn extract_json(raw: &str) -> Result<(Value, Vec<String>)> {
    let cleaned = strip_wrappers(raw);
    let candidate = match isolate_candidate(&cleaned) {
        Some(c) => c,
        None => {
            return Err(Error::UnparseableResponse {
                raw: raw.to_string(),
                attempts: vec!["isolate_json".to_string()],
            })
        }
    };

    let mut attempts = Vec::new();
    let mut current = candidate;

    if let Ok(value) = serde_json::from_str::<Value>(&current) {
        return Ok((value, attempts));
    }

    for repair in [
        Repair::StripTrailingCommas,
        Repair::CloseUnterminatedString,
        Repair::CloseOpenBrackets,
        Repair::SwapSingleQuotes,
    ] {
        if let Some(repaired) = repair.apply(&current) {
            attempts.push(repair.name().to_string());
            current = repaired;
            if let Ok(value) = serde_json::from_str::<Value>(&current) {
                log::debug!("model response repaired via {:?}", attempts);
                return Ok((value, attempts));
            }
        }
    }

    Err(Error::UnparseableResponse {
        raw: raw.to_string(),
        attempts,
    })
}

/// Remove reasoning-tag blocks and trailing end-of-sequence markers.
fn strip_wrappers(raw: &str) -> String {
    let s = RE_REASONING.replace_all(raw, "");
    let s = RE_DANGLING_TAG.replace_all(&s, "");
    RE_END_MARKERS.replace_all(&s, "").trim().to_string()
}

/// Pull the most plausible JSON payload out of the cleaned text: a fenced
/// block if present, then an explicit BEGIN/END marker pair, then a balanced
/// scan from the first opening bracket. A scan that runs off the end of a
/// truncated response keeps the remainder so the repair ladder can close it.
fn isolate_candidate(cleaned: &str) -> Option<String> {
    if let Some(caps) = RE_FENCE.captures(cleaned) {
        let inner = caps[1].trim();
        if !inner.is_empty() {
            return Some(inner.to_string());
        }
    }
    if let Some(caps) = RE_MARKER_PAIR.captures(cleaned) {
        let inner = caps[1].trim();
        if !inner.is_empty() {
            return Some(inner.to_string());
        }
    }

    let start = cleaned.find(['{', '['])?;
    let bytes = cleaned.as_bytes();
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                stack.pop();
                if stack.is_empty() {
                    return Some(cleaned[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    // Unbalanced to the end: a truncated payload.
    Some(cleaned[start..].trim_end().to_string())
}

#[derive(Debug, Clone, Copy)]
enum Repair {
    StripTrailingCommas,
    CloseUnterminatedString,
    CloseOpenBrackets,
    SwapSingleQuotes,
}

impl Repair {
    fn name(&self) -> &'static str {
        match self {
            Repair::StripTrailingCommas => "strip_trailing_commas",
            Repair::CloseUnterminatedString => "close_unterminated_string",
            Repair::CloseOpenBrackets => "close_open_brackets",
            Repair::SwapSingleQuotes => "swap_single_quotes",
        }
    }

    /// Apply this repair, or None when it does not change the candidate.
    fn apply(&self, candidate: &str) -> Option<String> {
        match self {
            Repair::StripTrailingCommas => {
                let repaired = RE_TRAILING_COMMA.replace_all(candidate, "$1");
                (repaired != candidate).then(|| repaired.into_owned())
            }
            Repair::CloseUnterminatedString => {
                let (_, in_string) = scan_state(candidate);
                in_string.then(|| format!("{candidate}\""))
            }
            Repair::CloseOpenBrackets => {
                let (stack, in_string) = scan_state(candidate);
                if stack.is_empty() || in_string {
                    return None;
                }
                let mut repaired = candidate.trim_end().trim_end_matches(',').to_string();
                for closer in stack.iter().rev() {
                    repaired.push(*closer as char);
                }
                Some(repaired)
            }
            Repair::SwapSingleQuotes => {
                // Only safe when the payload uses single quotes exclusively.
                (candidate.contains('\'') && !candidate.contains('"'))
                    .then(|| candidate.replace('\'', "\""))
            }
        }
    }
}

/// Walk the candidate tracking bracket nesting and string state.
fn scan_state(candidate: &str) -> (Vec<u8>, bool) {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for &b in candidate.as_bytes() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                stack.pop();
            }
            _ => {}
        }
    }
    (stack, in_string)
}
