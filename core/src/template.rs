//! Templated trigger requests
//!
//! Fields of a [`TemplatedTrigger`] may contain `{{ name }}` placeholders.
//! Rendering happens before the request reaches the controller, which only
//! ever sees resolved values.

use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::controller::TriggerRequest;
use crate::creator::ConfPayload;
use crate::errors::{Result, TriggerError};
use crate::identity::parse_logical_timestamp;
use crate::waiter::WaitPolicy;

pub trait TemplateResolver: Send + Sync {
    fn render(&self, template: &str) -> Result<String>;
}

/// Resolves `{{ name }}` against a fixed set of variables. Dotted names
/// (`{{ workflow.id }}`) are plain keys.
#[derive(Debug, Clone, Default)]
pub struct ContextResolver {
    variables: HashMap<String, String>,
}

impl ContextResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

impl TemplateResolver for ContextResolver {
    fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| TriggerError::Template {
                message: format!("Unclosed placeholder in '{}'", template),
            })?;

            let name = after[..end].trim();
            let value = self.variables.get(name).ok_or_else(|| TriggerError::Template {
                message: format!("Undefined variable '{}'", name),
            })?;
            out.push_str(value);
            rest = &after[end + 2..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

/// Trigger request whose string fields may still be templates.
#[derive(Debug, Clone)]
pub struct TemplatedTrigger {
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub logical_date: Option<String>,
    pub conf: Option<JsonValue>,
    pub reset: bool,
    pub wait_for_completion: bool,
    pub policy: WaitPolicy,
    pub triggered_by: String,
}

impl TemplatedTrigger {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: None,
            logical_date: None,
            conf: None,
            reset: false,
            wait_for_completion: false,
            policy: WaitPolicy::default(),
            triggered_by: crate::controller::DEFAULT_TRIGGER_SOURCE.to_string(),
        }
    }

    pub fn render(&self, resolver: &dyn TemplateResolver) -> Result<TriggerRequest> {
        let workflow_id = resolver.render(&self.workflow_id)?;

        let mut request = TriggerRequest::new(workflow_id)
            .reset(self.reset)
            .wait_for_completion(self.wait_for_completion)
            .policy(self.policy.clone())
            .triggered_by(resolver.render(&self.triggered_by)?);

        if let Some(run_id) = &self.run_id {
            request = request.run_id(resolver.render(run_id)?);
        }
        if let Some(date) = &self.logical_date {
            request = request.logical_timestamp(parse_logical_timestamp(&resolver.render(date)?)?);
        }
        if let Some(conf) = &self.conf {
            request.conf = ConfPayload::from_serializable(&render_value(conf, resolver)?);
        }

        Ok(request)
    }
}

/// Render every string inside a JSON value, keys included.
fn render_value(value: &JsonValue, resolver: &dyn TemplateResolver) -> Result<JsonValue> {
    Ok(match value {
        JsonValue::String(s) => JsonValue::String(resolver.render(s)?),
        JsonValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| render_value(item, resolver))
                .collect::<Result<_>>()?,
        ),
        JsonValue::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(resolver.render(key)?, render_value(item, resolver)?);
            }
            JsonValue::Object(rendered)
        }
        other => other.clone(),
    })
}
