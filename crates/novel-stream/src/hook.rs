use std::sync::Arc;

use tracing::info;

use crate::errors::StoreError;
use crate::store::{ProjectStore, SectionUpdate};

/// Pre-declared exchanges whose finalized artifact is persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistTarget {
    /// Whole-novel outline of a project.
    ProjectOutline { project: String },
    /// Outline of one chapter (the chapter title is re-sent unchanged).
    ChapterOutline {
        project: String,
        chapter_id: String,
        title: String,
    },
    /// Outline of one section.
    SectionOutline {
        project: String,
        chapter_id: String,
        section_id: String,
    },
    /// Body text of one section.
    SectionContent {
        project: String,
        chapter_id: String,
        section_id: String,
    },
}

/// Reaction to an exchange reaching `Complete` with a non-empty artifact.
///
/// Called at most once per successful exchange and never for failed or
/// canceled ones. Errors are reported on the outcome; the ledger is never
/// touched.
#[async_trait::async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_complete(&self, target: &PersistTarget, artifact: &str) -> Result<(), StoreError>;
}

/// Writes finished artifacts back to a `ProjectStore`.
pub struct StorePersistence {
    store: Arc<dyn ProjectStore>,
}

impl StorePersistence {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl CompletionHook for StorePersistence {
    async fn on_complete(&self, target: &PersistTarget, artifact: &str) -> Result<(), StoreError> {
        match target {
            PersistTarget::ProjectOutline { project } => {
                self.store.update_project_outline(project, artifact).await?;
            }
            PersistTarget::ChapterOutline {
                project,
                chapter_id,
                title,
            } => {
                self.store
                    .update_chapter(project, chapter_id, title, artifact)
                    .await?;
            }
            PersistTarget::SectionOutline {
                project,
                chapter_id,
                section_id,
            } => {
                let update = SectionUpdate {
                    outline: Some(artifact.to_string()),
                    ..SectionUpdate::default()
                };
                self.store
                    .update_section(project, chapter_id, section_id, &update)
                    .await?;
            }
            PersistTarget::SectionContent {
                project,
                chapter_id,
                section_id,
            } => {
                let update = SectionUpdate {
                    content: Some(artifact.to_string()),
                    ..SectionUpdate::default()
                };
                self.store
                    .update_section(project, chapter_id, section_id, &update)
                    .await?;
            }
        }
        info!(?target, chars = artifact.chars().count(), "persisted artifact");
        Ok(())
    }
}
