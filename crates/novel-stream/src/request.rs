use crate::hook::PersistTarget;
use crate::model::{AgentRole, Granularity};

/// Body of `POST /api/chat`. Context fields are empty strings when unused.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExchangeRequest {
    pub agent: AgentRole,
    pub topic: String,
    pub project_name: String,
    pub granularity: Granularity,
    #[serde(default)]
    pub chapter_title: String,
    #[serde(default)]
    pub critique: String,
    #[serde(default)]
    pub section_outline: String,
    #[serde(default)]
    pub draft: String,
    #[serde(default)]
    pub current_chapter: String,
    #[serde(default)]
    pub current_section: String,
}

/// One user action: what to send, plus where the finished artifact goes.
///
/// Built with chained setters, mirroring how the screens assemble requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationRequest {
    pub(crate) wire: ExchangeRequest,
    pub(crate) persist: Option<PersistTarget>,
}

impl GenerationRequest {
    /// Starts a request for `agent` in `project`.
    pub fn new(agent: AgentRole, project_name: impl Into<String>) -> Self {
        Self {
            wire: ExchangeRequest {
                agent,
                topic: String::new(),
                project_name: project_name.into(),
                granularity: Granularity::default(),
                chapter_title: String::new(),
                critique: String::new(),
                section_outline: String::new(),
                draft: String::new(),
                current_chapter: String::new(),
                current_section: String::new(),
            },
            persist: None,
        }
    }

    /// Role the request targets.
    pub fn agent(&self) -> AgentRole {
        self.wire.agent
    }

    /// Free-text instruction.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.wire.topic = topic.into();
        self
    }

    /// Scope of the generation.
    pub fn granularity(mut self, granularity: Granularity) -> Self {
        self.wire.granularity = granularity;
        self
    }

    /// Chapter title used by chapter-level planning.
    pub fn chapter_title(mut self, title: impl Into<String>) -> Self {
        self.wire.chapter_title = title.into();
        self
    }

    /// Reviewer feedback the writer should address.
    pub fn critique(mut self, critique: impl Into<String>) -> Self {
        self.wire.critique = critique.into();
        self
    }

    /// Outline the writer expands.
    pub fn section_outline(mut self, outline: impl Into<String>) -> Self {
        self.wire.section_outline = outline.into();
        self
    }

    /// Draft the reviewer critiques.
    pub fn draft(mut self, draft: impl Into<String>) -> Self {
        self.wire.draft = draft.into();
        self
    }

    /// Current chapter id.
    pub fn chapter(mut self, chapter_id: impl Into<String>) -> Self {
        self.wire.current_chapter = chapter_id.into();
        self
    }

    /// Current section id.
    pub fn section(mut self, section_id: impl Into<String>) -> Self {
        self.wire.current_section = section_id.into();
        self
    }

    /// Persists the finalized artifact to `target` once the exchange completes.
    pub fn persist_to(mut self, target: PersistTarget) -> Self {
        self.persist = Some(target);
        self
    }

    /// Wire body that will be sent.
    pub fn wire(&self) -> &ExchangeRequest {
        &self.wire
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_body_uses_backend_field_names_and_empty_defaults() {
        let request = GenerationRequest::new(AgentRole::Writer, "龙族")
            .granularity(Granularity::Section)
            .section_outline("outline")
            .chapter("c1")
            .section("s2");
        let body = serde_json::to_value(request.wire()).expect("serialize");
        assert_eq!(body["agent"], "writer");
        assert_eq!(body["project_name"], "龙族");
        assert_eq!(body["granularity"], "section");
        assert_eq!(body["section_outline"], "outline");
        assert_eq!(body["current_chapter"], "c1");
        assert_eq!(body["current_section"], "s2");
        assert_eq!(body["critique"], "");
        assert_eq!(body["topic"], "");
    }
}
