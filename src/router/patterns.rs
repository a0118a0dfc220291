//! Compiled intent patterns for the router bypass.
//!
//! Small local models are unreliable at tool selection, and a regex match
//! costs microseconds where a provider round trip costs seconds, so the
//! known intents route straight to a local tool. Match order is fixed:
//! datetime, then web search, then device control; first match wins.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassIntent {
    Datetime,
    WebSearch { query: String },
    DeviceControl { device: String, state: String },
}

static DATETIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(what\s+(time|day|date)\b|current\s+time|what's\s+the\s+(time|date))").unwrap()
});

static WEB_SEARCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(who\s+is|what\s+is|what\s+are|search\s+(for|the\s+web\s+for))\s+(?P<query>.+)$")
        .unwrap()
});

static DEVICE_ON_OFF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(turn|switch)\s+(?P<state>on|off)\s+(the\s+)?(?P<device>[a-z0-9 ]+?)[.!?]?$")
        .unwrap()
});

static DEVICE_ON_OFF_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(turn|switch)\s+(the\s+)?(?P<device>[a-z0-9 ]+?)\s+(?P<state>on|off)[.!?]?$")
        .unwrap()
});

static DEVICE_DIM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bdim\s+(the\s+)?(?P<device>[a-z0-9 ]+?)[.!?]?$").unwrap()
});

static DEVICE_SET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bset\s+(the\s+)?(?P<device>[a-z0-9 ]+?)\s+to\s+(?P<state>on|off)[.!?]?$")
        .unwrap()
});

/// Classify an utterance. Returns `None` when no pattern matches literally
/// and the provider should handle it.
pub fn match_intent(text: &str) -> Option<BypassIntent> {
    let text = text.trim();

    if DATETIME.is_match(text) {
        return Some(BypassIntent::Datetime);
    }

    if let Some(captures) = WEB_SEARCH.captures(text) {
        let query = captures["query"].trim().trim_end_matches(['.', '!', '?']);
        // "what is the time" styles already matched above; don't search
        // for pronouns either.
        if !query.is_empty() {
            return Some(BypassIntent::WebSearch {
                query: query.to_string(),
            });
        }
    }

    for pattern in [&*DEVICE_ON_OFF, &*DEVICE_ON_OFF_SUFFIX, &*DEVICE_SET] {
        if let Some(captures) = pattern.captures(text) {
            return Some(BypassIntent::DeviceControl {
                device: captures["device"].trim().to_lowercase(),
                state: captures["state"].to_lowercase(),
            });
        }
    }

    if let Some(captures) = DEVICE_DIM.captures(text) {
        // Dimming maps to the controller's "on" with the device's own dim
        // curve; level control is the provider's job.
        return Some(BypassIntent::DeviceControl {
            device: captures["device"].trim().to_lowercase(),
            state: "on".to_string(),
        });
    }

    None
}
