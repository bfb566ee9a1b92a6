//! `{{placeholder}}` rendering for message content and webhook payloads.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::types::Run;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("placeholder pattern is valid"))
}

/// Placeholder values available to a run's templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars(BTreeMap<&'static str, String>);

impl TemplateVars {
    pub fn for_run(run: &Run) -> Self {
        let event = &run.event;
        let mut vars = BTreeMap::new();
        vars.insert("username", event.display_name().to_string());
        vars.insert("user_id", event.platform_user_id.clone());
        vars.insert("platform", event.platform.to_string());
        vars.insert("content", event.content.clone());
        vars.insert("account_id", event.account_id.clone().unwrap_or_default());
        vars.insert("event_id", event.event_id.clone());
        vars.insert("flow_name", run.snapshot.flow_name.clone());
        vars.insert("run_id", run.id.clone());
        Self(vars)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// Replace known placeholders. Unknown ones are left as written.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Render every string leaf of a JSON value. Object keys are kept verbatim.
pub fn render_value(value: &Value, vars: &TemplateVars) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}
