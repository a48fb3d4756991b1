//! Core types for the capability inventory.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::config::ServerId;

/// Primitive kind of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Resource => "resource",
            CapabilityKind::Prompt => "prompt",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique capability identifier: `server_id:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedCapability {
    pub server_id: ServerId,
    pub name: String,
}

impl QualifiedCapability {
    pub fn new(server_id: impl Into<ServerId>, name: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            name: name.into(),
        }
    }

    /// Parse from "server:name" format.
    pub fn parse(s: &str) -> Option<Self> {
        let (server, name) = s.split_once(':')?;
        if server.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(server, name))
    }
}

impl fmt::Display for QualifiedCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_id, self.name)
    }
}

/// A tool, resource or prompt exposed by a capability server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub server_id: ServerId,
    pub kind: CapabilityKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tool input schema, or the declared argument list of a prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Capability {
    pub fn new(server_id: impl Into<ServerId>, kind: CapabilityKind, name: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            kind,
            name: name.into(),
            description: None,
            input_schema: None,
            uri: None,
            uri_template: None,
            mime_type: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    #[must_use]
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    #[must_use]
    pub fn with_uri_template(mut self, template: impl Into<String>) -> Self {
        self.uri_template = Some(template.into());
        self
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn qualified(&self) -> QualifiedCapability {
        QualifiedCapability::new(self.server_id.clone(), self.name.clone())
    }

    /// Whether `name` addresses this capability (resources also match by URI).
    pub fn matches(&self, name: &str) -> bool {
        self.name == name
            || self.uri.as_deref() == Some(name)
            || self.uri_template.as_deref() == Some(name)
    }
}

/// Everything one server exposed at its last successful discovery.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilitySet {
    pub server_id: ServerId,
    pub tools: Vec<Capability>,
    pub resources: Vec<Capability>,
    pub prompts: Vec<Capability>,
    pub discovered_at: DateTime<Utc>,
}

impl CapabilitySet {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            discovered_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len() + self.resources.len() + self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.tools
            .iter()
            .chain(self.prompts.iter())
            .chain(self.resources.iter())
    }

    pub fn of_kind(&self, kind: CapabilityKind) -> &[Capability] {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }

    pub fn find(&self, kind: CapabilityKind, name: &str) -> Option<&Capability> {
        self.of_kind(kind).iter().find(|c| c.matches(name))
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }
}

/// Links an agent definition to one capability it may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAssignment {
    pub agent_id: String,
    pub server_id: ServerId,
    pub kind: CapabilityKind,
    pub capability_name: String,
    /// Assignment-local name shown to the agent
    pub display_name: String,
}

impl ToolAssignment {
    pub fn new(
        agent_id: impl Into<String>,
        server_id: impl Into<ServerId>,
        kind: CapabilityKind,
        capability_name: impl Into<String>,
    ) -> Self {
        let capability_name = capability_name.into();
        Self {
            agent_id: agent_id.into(),
            server_id: server_id.into(),
            kind,
            display_name: capability_name.clone(),
            capability_name,
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_qualified_capability_parse() {
        let q = QualifiedCapability::parse("echo-server:echo").unwrap();
        assert_eq!(q.server_id.as_str(), "echo-server");
        assert_eq!(q.name, "echo");
        assert_eq!(q.to_string(), "echo-server:echo");

        assert!(QualifiedCapability::parse("no-separator").is_none());
        assert!(QualifiedCapability::parse(":echo").is_none());
    }

    #[test]
    fn test_resource_matches_by_uri() {
        let res = Capability::new("s1", CapabilityKind::Resource, "greeting")
            .with_uri("memo://greeting");
        assert!(res.matches("greeting"));
        assert!(res.matches("memo://greeting"));
        assert!(!res.matches("memo://other"));
    }

    #[test]
    fn test_capability_set_lookup() {
        let mut set = CapabilitySet::new(ServerId::new("s1"));
        set.tools.push(
            Capability::new("s1", CapabilityKind::Tool, "echo")
                .with_input_schema(json!({"type": "object"})),
        );
        set.prompts
            .push(Capability::new("s1", CapabilityKind::Prompt, "greet"));

        assert_eq!(set.len(), 2);
        assert!(set.find(CapabilityKind::Tool, "echo").is_some());
        assert!(set.find(CapabilityKind::Prompt, "echo").is_none());
        assert_eq!(set.tool_names(), vec!["echo"]);
    }

    #[test]
    fn test_assignment_display_name() {
        let a = ToolAssignment::new("agent-1", "s1", CapabilityKind::Tool, "echo");
        assert_eq!(a.display_name, "echo");
        let a = a.with_display_name("repeat");
        assert_eq!(a.display_name, "repeat");
        assert_eq!(a.capability_name, "echo");
    }
}
