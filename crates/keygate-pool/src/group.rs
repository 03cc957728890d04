use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub type GroupId = i64;

/// One header-rewrite rule applied to the upstream request.
///
/// `value: None` removes the header instead of setting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub name: String,
    pub value: Option<String>,
}

/// Weighted reference to a child group sharing the same channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateMember {
    pub group: GroupId,
    pub weight: u32,
}

/// Logical tenant. Resolved from the first URL segment after `/proxy/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    /// URL-unique name.
    pub name: String,
    /// Channel kind tag, e.g. `gemini` / `openai` / `anthropic`.
    pub channel: String,
    /// Upstream base URLs; the first entry is the primary.
    pub upstreams: Vec<String>,
    /// Endpoint used by key validation and cron revalidation.
    pub validation_endpoint: String,
    #[serde(default)]
    pub header_rules: Vec<HeaderRule>,
    /// Request-body overrides; values may use `@map` / `@default` envelopes.
    #[serde(default)]
    pub param_overrides: serde_json::Map<String, JsonValue>,
    /// Model used for minimal validation requests.
    pub test_model: String,
    /// Non-empty makes this an aggregate group drawing credentials from
    /// children by weight.
    #[serde(default)]
    pub aggregate: Vec<AggregateMember>,
}

impl Group {
    pub fn is_aggregate(&self) -> bool {
        !self.aggregate.is_empty()
    }

    pub fn primary_upstream(&self) -> Option<&str> {
        self.upstreams.first().map(|s| s.as_str())
    }
}
