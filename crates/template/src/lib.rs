//! ResourceSet templating: render objects from a YAML template and static
//! resources once per input record, and a small expression engine for
//! readiness checks.

#![forbid(unsafe_code)]

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use rset_core::object::ObjectKey;
use rset_core::{InputValues, Json};

pub mod expr;

pub use expr::{CelLite, CompiledExpr, ExprEngine};

/// Turns (template, static resources, inputs) into objects. Implementations
/// must be deterministic for identical arguments.
pub trait Builder: Send + Sync {
    fn build(&self, template: Option<&str>, resources: &[Json], inputs: &[InputValues]) -> Result<Vec<Json>>;
}

fn max_template_bytes() -> usize {
    std::env::var("RSET_MAX_TEMPLATE_BYTES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1_000_000)
}

fn max_template_nodes() -> usize {
    std::env::var("RSET_MAX_TEMPLATE_NODES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<<\s*(inputs(?:\.[A-Za-z0-9_\-]+)*)\s*(?:\|\s*([a-z]+)\s*)?>>").expect("valid placeholder regex")
});

/// `<< inputs.path >>` substitution over YAML documents and static objects.
///
/// A string that is exactly one placeholder is replaced by the typed input
/// value; placeholders embedded in longer strings are stringified. The
/// `quote` filter always yields a string.
#[derive(Debug, Clone)]
pub struct TemplateBuilder {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for TemplateBuilder {
    fn default() -> Self {
        Self { max_bytes: max_template_bytes(), max_nodes: max_template_nodes() }
    }
}

fn lookup<'a>(inputs: &'a InputValues, path: &str) -> Result<&'a Json> {
    let mut parts = path.split('.');
    if parts.next() != Some("inputs") {
        bail!("placeholder {} must start with inputs", path);
    }
    let first = parts.next().ok_or_else(|| anyhow!("placeholder {} selects no input", path))?;
    let mut cur = inputs.get(first).ok_or_else(|| anyhow!("{} is not defined", path))?;
    for part in parts {
        cur = match cur {
            Json::Object(map) => map.get(part),
            Json::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(|| anyhow!("{} is not defined", path))?;
    }
    Ok(cur)
}

fn stringify(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        Json::Bool(_) | Json::Number(_) => v.to_string(),
        other => other.to_string(),
    }
}

fn render_str(s: &str, inputs: &InputValues) -> Result<Json> {
    if let Some(caps) = PLACEHOLDER.captures(s) {
        let whole = caps.get(0).map_or(false, |m| m.start() == 0 && m.end() == s.len());
        if whole {
            let value = lookup(inputs, &caps[1])?;
            return match caps.get(2).map(|m| m.as_str()) {
                None => Ok(value.clone()),
                Some("quote") => Ok(Json::String(stringify(value))),
                Some(other) => Err(anyhow!("unknown filter {}", other)),
            };
        }
    } else {
        return Ok(Json::String(s.to_string()));
    }
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(s) {
        let m = caps.get(0).ok_or_else(|| anyhow!("placeholder match"))?;
        if let Some(filter) = caps.get(2).map(|f| f.as_str()).filter(|f| *f != "quote") {
            bail!("unknown filter {}", filter);
        }
        out.push_str(&s[last..m.start()]);
        out.push_str(&stringify(lookup(inputs, &caps[1])?));
        last = m.end();
    }
    out.push_str(&s[last..]);
    Ok(Json::String(out))
}

fn render(v: &Json, inputs: &InputValues) -> Result<Json> {
    Ok(match v {
        Json::String(s) => render_str(s, inputs)?,
        Json::Array(items) => Json::Array(items.iter().map(|i| render(i, inputs)).collect::<Result<_>>()?),
        Json::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, vv) in map {
                let key = match render_str(k, inputs)? {
                    Json::String(s) => s,
                    other => stringify(&other),
                };
                out.insert(key, render(vv, inputs)?);
            }
            Json::Object(out)
        }
        other => other.clone(),
    })
}

impl TemplateBuilder {
    /// Parse a multi-document YAML template; empty documents are dropped.
    fn parse_template(&self, template: &str) -> Result<Vec<Json>> {
        if template.len() > self.max_bytes {
            bail!("template too large (>{} bytes)", self.max_bytes);
        }
        let mut docs = Vec::new();
        for (idx, doc) in serde_yaml::Deserializer::from_str(template).enumerate() {
            let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing template document {}", idx))?;
            if value.is_null() {
                continue;
            }
            let json = serde_json::to_value(value).with_context(|| format!("converting template document {}", idx))?;
            if json_node_budget_exceeded(&json, self.max_nodes) {
                bail!("template document {} too complex (>{} nodes)", idx, self.max_nodes);
            }
            docs.push(json);
        }
        Ok(docs)
    }
}

impl Builder for TemplateBuilder {
    fn build(&self, template: Option<&str>, resources: &[Json], inputs: &[InputValues]) -> Result<Vec<Json>> {
        let mut sources = match template {
            Some(t) if !t.trim().is_empty() => self.parse_template(t)?,
            _ => Vec::new(),
        };
        sources.extend(resources.iter().cloned());

        let mut objects: Vec<(ObjectKey, Json)> = Vec::new();
        for (idx, input) in inputs.iter().enumerate() {
            for source in &sources {
                let obj = render(source, input).with_context(|| format!("rendering template for input {}", idx))?;
                let key = ObjectKey::from_object(&obj).with_context(|| format!("rendering template for input {}", idx))?;
                match objects.iter().find(|(k, _)| k.same_object(&key)) {
                    Some((_, existing)) if *existing == obj => continue,
                    Some(_) => bail!("duplicate object {} with different content", key),
                    None => objects.push((key, obj)),
                }
            }
        }
        debug!(inputs = inputs.len(), objects = objects.len(), "template built");
        Ok(objects.into_iter().map(|(_, o)| o).collect())
    }
}
