//! Configurable route table.
//!
//! Rules are compiled once from configuration and never mutated afterwards. Reconfiguration
//! builds a new [`RouteTable`] and swaps it into the [`SharedRouteTable`] in one step.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Regex,
}

impl MatchType {
    /// Unknown or missing values fall back to exact matching.
    fn from_raw(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()) {
            Some(value) if value == "regex" => Self::Regex,
            _ => Self::Exact,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MethodSet {
    All,
    Only(BTreeSet<String>),
}

impl MethodSet {
    const ALL: &'static str = "all";

    /// Falsy values (absent, `null`, `false`, `""`, `0`) mean every method. A string or array of
    /// strings is lower-cased; a set mentioning `all` collapses to [`MethodSet::All`].
    pub fn from_value(value: Option<&Value>, path: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidMethod {
            path: path.to_string(),
        };
        let methods: BTreeSet<String> = match value {
            None | Some(Value::Null) | Some(Value::Bool(false)) => return Ok(Self::All),
            Some(Value::String(method)) if method.is_empty() => return Ok(Self::All),
            Some(Value::Number(number)) if number.as_f64() == Some(0.0) => return Ok(Self::All),
            Some(Value::String(method)) => BTreeSet::from([method.to_ascii_lowercase()]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_ascii_lowercase).ok_or_else(invalid))
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(invalid()),
        };
        if methods.contains(Self::ALL) {
            Ok(Self::All)
        } else {
            Ok(Self::Only(methods))
        }
    }

    pub fn allows(&self, method: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(methods) => methods.contains(&method.to_ascii_lowercase()),
        }
    }
}

impl fmt::Display for MethodSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(Self::ALL),
            Self::Only(methods) => {
                let joined = methods.iter().cloned().collect::<Vec<_>>().join(",");
                f.write_str(&joined)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    MessageQueue,
    ReverseProxy,
}

impl HandlerKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "message_queue" => Some(Self::MessageQueue),
            "reverse_proxy" => Some(Self::ReverseProxy),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageQueue => "message_queue",
            Self::ReverseProxy => "reverse_proxy",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteTarget {
    MessageQueue {
        queue_name: String,
    },
    ReverseProxy {
        redirect_path: String,
        ignore_path: bool,
    },
}

impl RouteTarget {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::MessageQueue { .. } => HandlerKind::MessageQueue,
            Self::ReverseProxy { .. } => HandlerKind::ReverseProxy,
        }
    }
}

/// A rule as it appears in configuration, before validation.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawRouteRule {
    #[serde(default)]
    pub path: Option<Value>,
    #[serde(default)]
    pub method: Option<Value>,
    #[serde(default)]
    pub match_type: Option<String>,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub redirect_path: Option<String>,
    #[serde(default)]
    pub ignore_path: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct RouteRule {
    pub pattern: String,
    pub match_type: MatchType,
    pub methods: MethodSet,
    pub target: RouteTarget,
    matcher: Option<Regex>,
}

impl RouteRule {
    fn compile(index: usize, raw: &RawRouteRule) -> Result<Self, ConfigError> {
        let pattern = match raw.path.as_ref() {
            Some(Value::String(path)) if !path.is_empty() => path.clone(),
            _ => return Err(ConfigError::InvalidPath { index }),
        };
        let match_type = MatchType::from_raw(raw.match_type.as_deref());
        let methods = MethodSet::from_value(raw.method.as_ref(), &pattern)?;
        let kind = raw
            .handler
            .as_deref()
            .and_then(HandlerKind::parse)
            .ok_or_else(|| ConfigError::InvalidHandler {
                path: pattern.clone(),
            })?;
        let target = match kind {
            HandlerKind::MessageQueue => RouteTarget::MessageQueue {
                queue_name: non_empty(raw.queue_name.as_deref()).ok_or_else(|| {
                    ConfigError::MissingQueueName {
                        path: pattern.clone(),
                    }
                })?,
            },
            HandlerKind::ReverseProxy => RouteTarget::ReverseProxy {
                redirect_path: non_empty(raw.redirect_path.as_deref()).ok_or_else(|| {
                    ConfigError::MissingRedirectPath {
                        path: pattern.clone(),
                    }
                })?,
                ignore_path: raw.ignore_path.unwrap_or(false),
            },
        };
        let matcher = match match_type {
            MatchType::Exact => None,
            MatchType::Regex => {
                Some(
                    Regex::new(&pattern).map_err(|err| ConfigError::InvalidPattern {
                        path: pattern.clone(),
                        message: err.to_string(),
                    })?,
                )
            }
        };
        Ok(Self {
            pattern,
            match_type,
            methods,
            target,
            matcher,
        })
    }

    pub fn kind(&self) -> HandlerKind {
        self.target.kind()
    }

    /// Capture groups on success; exact rules match with no captures.
    fn match_path(&self, path: &str) -> Option<Vec<Option<String>>> {
        match &self.matcher {
            None => (self.pattern == path).then(Vec::new),
            Some(regex) => regex.captures(path).map(|captures| {
                captures
                    .iter()
                    .map(|group| group.map(|m| m.as_str().to_string()))
                    .collect()
            }),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|value| !value.is_empty()).map(str::to_string)
}

#[derive(Clone, Debug)]
pub struct RouteMatch {
    pub rule: Arc<RouteRule>,
    /// Group 0 is the whole match, as in regex captures.
    pub captures: Vec<Option<String>>,
}

impl RouteMatch {
    pub fn capture(&self, index: usize) -> Option<&str> {
        self.captures.get(index).and_then(|group| group.as_deref())
    }

    /// The reverse-proxy target with `$n` references replaced by capture groups.
    pub fn redirect_target(&self) -> Option<String> {
        match &self.rule.target {
            RouteTarget::ReverseProxy { redirect_path, .. } => {
                Some(substitute_captures(redirect_path, &self.captures))
            }
            RouteTarget::MessageQueue { .. } => None,
        }
    }
}

/// Replace `$1`, `$2`, ... in `template`. References to missing groups become empty; a `$` not
/// followed by a digit is kept.
pub fn substitute_captures(template: &str, captures: &[Option<String>]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        let mut digits = String::new();
        while let Some(&(_, next)) = chars.peek() {
            if !next.is_ascii_digit() {
                break;
            }
            digits.push(next);
            chars.next();
        }
        match digits.parse::<usize>() {
            Ok(index) => {
                if let Some(Some(group)) = captures.get(index) {
                    out.push_str(group);
                }
            }
            Err(_) => out.push('$'),
        }
    }
    out
}

#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    rules: Vec<Arc<RouteRule>>,
}

impl RouteTable {
    pub fn compile(raw_rules: &[RawRouteRule]) -> Result<Self, ConfigError> {
        let rules = raw_rules
            .iter()
            .enumerate()
            .map(|(index, raw)| RouteRule::compile(index, raw).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// First rule in declaration order whose method and path both match.
    pub fn match_request(&self, method: &str, path: &str) -> Option<RouteMatch> {
        self.rules.iter().find_map(|rule| {
            if !rule.methods.allows(method) {
                return None;
            }
            rule.match_path(path).map(|captures| RouteMatch {
                rule: Arc::clone(rule),
                captures,
            })
        })
    }

    pub fn rules(&self) -> impl Iterator<Item = &RouteRule> {
        self.rules.iter().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// The live route table. Readers take a snapshot; writers replace the whole table.
#[derive(Default)]
pub struct SharedRouteTable {
    current: RwLock<Arc<RouteTable>>,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    pub fn snapshot(&self) -> Arc<RouteTable> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, table: RouteTable) {
        let table = Arc::new(table);
        match self.current.write() {
            Ok(mut guard) => *guard = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawRouteRule {
        serde_json::from_value(value).unwrap()
    }

    fn compile(values: Vec<Value>) -> Result<RouteTable, ConfigError> {
        let rules: Vec<RawRouteRule> = values.into_iter().map(raw).collect();
        RouteTable::compile(&rules)
    }

    #[test]
    fn normalizes_methods() {
        let table = compile(vec![
            json!({"path": "/a", "method": null, "handler": "message_queue", "queue_name": "q"}),
            json!({"path": "/b", "method": "pUt", "handler": "message_queue", "queue_name": "q"}),
            json!({"path": "/c", "method": ["GET", "post"], "handler": "MESSAGE_QUEUE", "queue_name": "q"}),
            json!({"path": "/d", "method": ["get", "ALL"], "handler": "message_queue", "queue_name": "q"}),
        ])
        .unwrap();
        let methods: Vec<MethodSet> = table.rules().map(|rule| rule.methods.clone()).collect();
        assert_eq!(methods[0], MethodSet::All);
        assert_eq!(methods[1], MethodSet::Only(BTreeSet::from(["put".to_string()])));
        assert_eq!(
            methods[2],
            MethodSet::Only(BTreeSet::from(["get".to_string(), "post".to_string()]))
        );
        assert_eq!(methods[3], MethodSet::All);
    }

    #[test]
    fn reverse_proxy_defaults_ignore_path() {
        let table = compile(vec![json!({
            "path": "/v1/test",
            "method": "delete",
            "handler": "reverse_proxy",
            "redirect_path": "http://www.example.com"
        })])
        .unwrap();
        let rule = table.rules().next().unwrap();
        assert_eq!(rule.match_type, MatchType::Exact);
        assert_eq!(
            rule.target,
            RouteTarget::ReverseProxy {
                redirect_path: "http://www.example.com".to_string(),
                ignore_path: false,
            }
        );
    }

    #[test]
    fn rejects_invalid_rules() {
        let cases = vec![
            (
                json!({"method": null, "handler": "message_queue", "queue_name": "q"}),
                ConfigError::InvalidPath { index: 0 },
            ),
            (
                json!({"path": "/v1/test", "method": 324234, "handler": "message_queue", "queue_name": "q"}),
                ConfigError::InvalidMethod { path: "/v1/test".to_string() },
            ),
            (
                json!({"path": "/v1/test", "method": {}, "handler": "message_queue", "queue_name": "q"}),
                ConfigError::InvalidMethod { path: "/v1/test".to_string() },
            ),
            (
                json!({"path": "/v1/test", "queue_name": "q"}),
                ConfigError::InvalidHandler { path: "/v1/test".to_string() },
            ),
            (
                json!({"path": "/v1/test", "handler": "message_queue"}),
                ConfigError::MissingQueueName { path: "/v1/test".to_string() },
            ),
            (
                json!({"path": "/v1/test", "handler": "reverse_proxy"}),
                ConfigError::MissingRedirectPath { path: "/v1/test".to_string() },
            ),
        ];
        for (rule, expected) in cases {
            assert_eq!(compile(vec![rule]).unwrap_err(), expected);
        }
    }

    #[test]
    fn rejects_bad_regex_at_compile_time() {
        let err = compile(vec![json!({
            "path": "/v1/(unclosed",
            "match_type": "regex",
            "handler": "message_queue",
            "queue_name": "q"
        })])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn first_matching_rule_wins() {
        let table = compile(vec![
            json!({"path": "/v1/test_1", "handler": "message_queue", "queue_name": "q1"}),
            json!({"path": "/v1/test_2", "handler": "reverse_proxy", "redirect_path": "http://www.example.com"}),
            json!({"path": "\\/v1\\/test_[\\w]+", "match_type": "regex", "handler": "reverse_proxy", "redirect_path": "http://other"}),
        ])
        .unwrap();

        let hit = table.match_request("GET", "/v1/test_1").unwrap();
        assert_eq!(hit.rule.kind(), HandlerKind::MessageQueue);
        let hit = table.match_request("GET", "/v1/test_2").unwrap();
        assert_eq!(hit.redirect_target().as_deref(), Some("http://www.example.com"));
        let hit = table.match_request("POST", "/v1/test_3_abc").unwrap();
        assert_eq!(hit.redirect_target().as_deref(), Some("http://other"));
        assert!(table.match_request("GET", "/v1/asdfsd").is_none());
    }

    #[test]
    fn method_filter_applies_before_path() {
        let table = compile(vec![
            json!({"path": "/v1/t1", "method": "GET", "handler": "message_queue", "queue_name": "gets"}),
            json!({"path": "/v1/t1", "handler": "message_queue", "queue_name": "rest"}),
        ])
        .unwrap();
        let queue = |method: &str| match &table.match_request(method, "/v1/t1").unwrap().rule.target {
            RouteTarget::MessageQueue { queue_name } => queue_name.clone(),
            other => panic!("unexpected target {other:?}"),
        };
        assert_eq!(queue("get"), "gets");
        assert_eq!(queue("POST"), "rest");
    }

    #[test]
    fn substitutes_regex_captures_into_redirect() {
        let table = compile(vec![json!({
            "path": "\\/v1\\/(test)_(\\d)",
            "match_type": "regex",
            "handler": "reverse_proxy",
            "redirect_path": "http://example.com/$1/$2"
        })])
        .unwrap();
        let hit = table.match_request("GET", "/v1/test_4").unwrap();
        assert_eq!(hit.capture(1), Some("test"));
        assert_eq!(
            hit.redirect_target().as_deref(),
            Some("http://example.com/test/4")
        );
    }

    #[test]
    fn substitution_keeps_literal_dollar() {
        let captures = vec![Some("all".to_string()), Some("x".to_string())];
        assert_eq!(substitute_captures("a$b/$1/$9", &captures), "a$b/x/");
    }

    #[test]
    fn shared_table_swaps_atomically() {
        let shared = SharedRouteTable::new(RouteTable::default());
        let before = shared.snapshot();
        shared.replace(
            compile(vec![json!({"path": "/x", "handler": "message_queue", "queue_name": "q"})])
                .unwrap(),
        );
        assert!(before.is_empty());
        assert_eq!(shared.snapshot().len(), 1);
    }
}
