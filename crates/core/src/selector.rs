//! Kubernetes label selectors: validation, query rendering and matching.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("invalid label key {0:?}")]
    Key(String),
    #[error("invalid label value {value:?} for key {key:?}")]
    Value { key: String, value: String },
    #[error("unknown selector operator {0:?}")]
    Operator(String),
    #[error("selector operator {op} on key {key:?} requires at least one value")]
    MissingValues { key: String, op: String },
    #[error("selector operator {op} on key {key:?} takes no values")]
    UnexpectedValues { key: String, op: String },
}

fn valid_key(key: &str) -> bool {
    let name = match key.rsplit_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() || prefix.len() > 253 { return false; }
            if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') { return false; }
            name
        }
        None => key,
    };
    !name.is_empty() && name.len() <= 63 && valid_value(name)
}

fn valid_value(v: &str) -> bool {
    if v.is_empty() { return true; }
    let bytes = v.as_bytes();
    v.len() <= 63
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && v.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

impl LabelSelector {
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn validate(&self) -> Result<(), SelectorError> {
        for (k, v) in &self.match_labels {
            if !valid_key(k) { return Err(SelectorError::Key(k.clone())); }
            if !valid_value(v) { return Err(SelectorError::Value { key: k.clone(), value: v.clone() }); }
        }
        for req in &self.match_expressions {
            if !valid_key(&req.key) { return Err(SelectorError::Key(req.key.clone())); }
            match req.operator.as_str() {
                "In" | "NotIn" => {
                    if req.values.is_empty() {
                        return Err(SelectorError::MissingValues { key: req.key.clone(), op: req.operator.clone() });
                    }
                    if let Some(bad) = req.values.iter().find(|v| !valid_value(v)) {
                        return Err(SelectorError::Value { key: req.key.clone(), value: bad.clone() });
                    }
                }
                "Exists" | "DoesNotExist" => {
                    if !req.values.is_empty() {
                        return Err(SelectorError::UnexpectedValues { key: req.key.clone(), op: req.operator.clone() });
                    }
                }
                other => return Err(SelectorError::Operator(other.to_string())),
            }
        }
        Ok(())
    }

    /// Render as a list-call `labelSelector` query, e.g. `a=b,env in (dev,qa),!legacy`.
    pub fn to_query(&self) -> Result<String, SelectorError> {
        self.validate()?;
        let mut parts: Vec<String> = self.match_labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        for req in &self.match_expressions {
            parts.push(match req.operator.as_str() {
                "In" => format!("{} in ({})", req.key, req.values.join(",")),
                "NotIn" => format!("{} notin ({})", req.key, req.values.join(",")),
                "Exists" => req.key.clone(),
                _ => format!("!{}", req.key),
            });
        }
        Ok(parts.join(","))
    }

    /// Match a label set. An empty selector matches everything; an invalid
    /// requirement matches nothing.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_ok = self.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v));
        labels_ok
            && self.match_expressions.iter().all(|req| {
                let cur = labels.get(&req.key);
                match req.operator.as_str() {
                    "In" => cur.map(|v| req.values.contains(v)).unwrap_or(false),
                    "NotIn" => cur.map(|v| !req.values.contains(v)).unwrap_or(true),
                    "Exists" => cur.is_some(),
                    "DoesNotExist" => cur.is_none(),
                    _ => false,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement { key: key.into(), operator: op.into(), values: values.iter().map(|s| s.to_string()).collect() }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn renders_query_in_label_then_expression_order() {
        let sel = LabelSelector {
            match_labels: labels(&[("app", "podinfo")]),
            match_expressions: vec![req("env", "In", &["dev", "qa"]), req("legacy", "DoesNotExist", &[])],
        };
        assert_eq!(sel.to_query().unwrap(), "app=podinfo,env in (dev,qa),!legacy");
    }

    #[test]
    fn matches_expressions() {
        let sel = LabelSelector {
            match_labels: labels(&[("app", "podinfo")]),
            match_expressions: vec![req("env", "NotIn", &["prod"]), req("team", "Exists", &[])],
        };
        assert!(sel.matches(&labels(&[("app", "podinfo"), ("team", "a")])));
        assert!(!sel.matches(&labels(&[("app", "podinfo"), ("team", "a"), ("env", "prod")])));
        assert!(!sel.matches(&labels(&[("app", "podinfo")])));
        assert!(LabelSelector::default().matches(&labels(&[])));
    }

    #[test]
    fn rejects_malformed_selectors() {
        let bad_op = LabelSelector { match_expressions: vec![req("a", "Like", &["x"])], ..Default::default() };
        assert_eq!(bad_op.validate(), Err(SelectorError::Operator("Like".into())));

        let no_values = LabelSelector { match_expressions: vec![req("a", "In", &[])], ..Default::default() };
        assert!(matches!(no_values.validate(), Err(SelectorError::MissingValues { .. })));

        let bad_key = LabelSelector { match_labels: labels(&[("bad key", "x")]), ..Default::default() };
        assert!(matches!(bad_key.to_query(), Err(SelectorError::Key(_))));
    }
}
