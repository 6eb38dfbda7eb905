use std::fmt;
use std::str::FromStr;

/// One of the three fixed agent roles served by the backend pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Produces outlines.
    Planner,
    /// Produces drafts from an outline.
    Writer,
    /// Produces critiques of a draft.
    Reviewer,
}

impl AgentRole {
    /// All roles in pipeline order.
    pub const ALL: [AgentRole; 3] = [AgentRole::Planner, AgentRole::Writer, AgentRole::Reviewer];

    /// Wire name of the role (`planner`, `writer`, `reviewer`).
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Writer => "writer",
            AgentRole::Reviewer => "reviewer",
        }
    }

    /// Role whose finalized artifact must be non-empty before this role may run.
    pub fn prerequisite(self) -> Option<AgentRole> {
        match self {
            AgentRole::Planner => None,
            AgentRole::Writer => Some(AgentRole::Planner),
            AgentRole::Reviewer => Some(AgentRole::Writer),
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            AgentRole::Planner => 0,
            AgentRole::Writer => 1,
            AgentRole::Reviewer => 2,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a known role or granularity.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl FromStr for AgentRole {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "planner" => Ok(AgentRole::Planner),
            "writer" => Ok(AgentRole::Writer),
            "reviewer" => Ok(AgentRole::Reviewer),
            other => Err(UnknownVariant {
                kind: "agent role",
                value: other.to_string(),
            }),
        }
    }
}

/// Scope of a generation request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Whole-novel outline.
    #[default]
    Novel,
    /// One chapter.
    Chapter,
    /// One section of a chapter.
    Section,
}

impl Granularity {
    /// Wire name of the granularity.
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Novel => "novel",
            Granularity::Chapter => "chapter",
            Granularity::Section => "section",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "novel" => Ok(Granularity::Novel),
            "chapter" => Ok(Granularity::Chapter),
            "section" => Ok(Granularity::Section),
            other => Err(UnknownVariant {
                kind: "granularity",
                value: other.to_string(),
            }),
        }
    }
}

/// Who a ledger message belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    /// One of the agent roles.
    Agent(AgentRole),
    /// The person driving the screen.
    User,
    /// Out-of-band notices and errors.
    System,
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Author::Agent(role) => role.fmt(f),
            Author::User => f.write_str("user"),
            Author::System => f.write_str("system"),
        }
    }
}

/// Maps each role to the single field its deltas accumulate into.
///
/// The mapping is fixed per screen context and never discovered from the
/// stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMap {
    fields: [String; 3],
}

impl FieldMap {
    /// Field that carries system and user text.
    pub const MESSAGE_FIELD: &'static str = "message";

    /// Builds a mapping from explicit field names.
    pub fn new(
        planner: impl Into<String>,
        writer: impl Into<String>,
        reviewer: impl Into<String>,
    ) -> Self {
        Self {
            fields: [planner.into(), writer.into(), reviewer.into()],
        }
    }

    /// Mapping used by the backend for a given granularity.
    pub fn for_granularity(granularity: Granularity) -> Self {
        let planner = match granularity {
            Granularity::Novel => "novel_outline",
            Granularity::Chapter => "chapter_structure",
            Granularity::Section => "section_outline",
        };
        Self::new(planner, "draft", "critique")
    }

    /// Designated field for a role.
    pub fn field(&self, role: AgentRole) -> &str {
        &self.fields[role.index()]
    }
}

impl Default for FieldMap {
    fn default() -> Self {
        Self::for_granularity(Granularity::Novel)
    }
}
