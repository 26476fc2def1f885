//! Redaction of secrets before anything reaches a log line.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

pub const REDACTED: &str = "***REDACTED***";
pub const TRUNCATED_SUFFIX: &str = "...[TRUNCATED]";

const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    "api_key",
    "api-key",
    "apikey",
    "authorization",
    "auth",
    "token",
    "secret",
    "password",
    "passwd",
    "pwd",
    "private_key",
    "privatekey",
    "access_token",
    "refresh_token",
    "bearer",
    "x-api-key",
];

static BEARER_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9\-._~+/]+=*").ok());

static KEY_VALUE_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(api[_-]?key|access_token|token|secret|password)(\s*[=:]\s*)("?)[^\s"&,;]+"#)
        .ok()
});

/// Redacts sensitive keys, truncates content previews and cleans endpoints.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    sensitive_keys: HashSet<String>,
    max_content_length: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            sensitive_keys: DEFAULT_SENSITIVE_KEYS.iter().map(|k| k.to_string()).collect(),
            max_content_length: 500,
        }
    }
}

impl Sanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_content_length(mut self, max: usize) -> Self {
        self.max_content_length = max;
        self
    }

    pub fn with_sensitive_key(mut self, key: impl Into<String>) -> Self {
        self.sensitive_keys.insert(key.into().to_lowercase());
        self
    }

    pub fn is_sensitive_key(&self, key: &str) -> bool {
        self.sensitive_keys.contains(&key.to_lowercase())
    }

    pub fn sanitize_map(&self, data: &HashMap<String, Value>) -> HashMap<String, Value> {
        data.iter()
            .map(|(k, v)| (k.clone(), self.sanitize_entry(k, v)))
            .collect()
    }

    /// Recursively redact sensitive keys in objects (including objects nested in arrays).
    pub fn sanitize_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(obj) => {
                let mut out = Map::with_capacity(obj.len());
                for (k, v) in obj {
                    out.insert(k.clone(), self.sanitize_entry(k, v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize_value(v)).collect()),
            Value::String(s) => Value::String(self.sanitize_text(s)),
            other => other.clone(),
        }
    }

    fn sanitize_entry(&self, key: &str, value: &Value) -> Value {
        if self.is_sensitive_key(key) {
            Value::String(REDACTED.to_string())
        } else {
            self.sanitize_value(value)
        }
    }

    /// Truncate to `max_content_length` characters and mask inline credentials.
    pub fn sanitize_content(&self, content: &str) -> String {
        if content.is_empty() {
            return String::new();
        }
        let masked = self.sanitize_text(content);
        match masked.char_indices().nth(self.max_content_length) {
            Some((cut, _)) => format!("{}{}", &masked[..cut], TRUNCATED_SUFFIX),
            None => masked,
        }
    }

    /// Mask `Bearer <token>` and `api_key=<value>` style fragments in free text.
    pub fn sanitize_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        if let Some(re) = BEARER_PATTERN.as_ref() {
            out = re.replace_all(&out, format!("$1 {}", REDACTED)).into_owned();
        }
        if let Some(re) = KEY_VALUE_PATTERN.as_ref() {
            out = re
                .replace_all(&out, format!("${{1}}${{2}}${{3}}{}", REDACTED))
                .into_owned();
        }
        out
    }

    /// Drop query string, fragment and user info from an endpoint URL.
    pub fn sanitize_endpoint(&self, endpoint: &str) -> String {
        match url::Url::parse(endpoint) {
            Ok(mut url) => {
                url.set_query(None);
                url.set_fragment(None);
                let _ = url.set_username("");
                let _ = url.set_password(None);
                url.to_string()
            }
            Err(_) => endpoint
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }
}
