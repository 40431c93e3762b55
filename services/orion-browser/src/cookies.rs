//! Cookie jar shared between the browser harvester and the HTTP fetcher.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::BrowserError;

/// Name → value cookie map with a stable header rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CookiePair {
    name: String,
    value: String,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a jar from (name, value) pairs; empty names are dropped.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let cookies = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _): &(String, String)| !k.trim().is_empty())
            .collect();
        Self { cookies }
    }

    /// Parse cookies from JSON.
    ///
    /// Accepts either an object (`{"cf_clearance": "..."}`) or the list form
    /// exported by browsers (`[{"name": "...", "value": "..."}]`).
    pub fn from_json(raw: &str) -> Result<Self, BrowserError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| BrowserError::InvalidCookies(e.to_string()))?;

        match value {
            Value::Object(map) => Ok(Self::from_pairs(map.into_iter().map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            }))),
            Value::Array(_) => {
                let pairs: Vec<CookiePair> = serde_json::from_value(value)
                    .map_err(|e| BrowserError::InvalidCookies(e.to_string()))?;
                Ok(Self::from_pairs(pairs.into_iter().map(|p| (p.name, p.value))))
            }
            _ => Err(BrowserError::InvalidCookies(
                "expected an object or a list of name/value pairs".into(),
            )),
        }
    }

    /// Add or replace cookies from another jar.
    pub fn merge(&mut self, other: CookieJar) {
        self.cookies.extend(other.cookies);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Cookie names, for logging without leaking values.
    pub fn names(&self) -> Vec<&str> {
        self.cookies.keys().map(String::as_str).collect()
    }

    /// Render as a `cookie` request header value, or None when empty.
    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_form() {
        let jar = CookieJar::from_json(r#"{"cf_clearance": "abc", "session": 42}"#).unwrap();
        assert_eq!(jar.len(), 2);
        assert_eq!(jar.get("cf_clearance"), Some("abc"));
        assert_eq!(jar.get("session"), Some("42"));
    }

    #[test]
    fn test_parse_list_form() {
        let jar = CookieJar::from_json(
            r#"[{"name": "cf_clearance", "value": "abc", "domain": ".orionterminal.com"},
                {"name": "lang", "value": "en"}]"#,
        )
        .unwrap();
        assert_eq!(jar.header_value().unwrap(), "cf_clearance=abc; lang=en");
    }

    #[test]
    fn test_parse_rejects_scalars() {
        assert!(CookieJar::from_json("\"cookie\"").is_err());
        assert!(CookieJar::from_json("not json").is_err());
    }

    #[test]
    fn test_merge_overrides() {
        let mut jar = CookieJar::from_pairs([("a", "1"), ("b", "2")]);
        jar.merge(CookieJar::from_pairs([("b", "3"), ("c", "4")]));
        assert_eq!(jar.header_value().unwrap(), "a=1; b=3; c=4");
        assert_eq!(jar.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_empty_jar_has_no_header() {
        let jar = CookieJar::from_pairs([("  ", "x")]);
        assert!(jar.is_empty());
        assert!(jar.header_value().is_none());
    }
}
