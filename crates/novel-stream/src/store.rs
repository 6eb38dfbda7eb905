//! Project/chapter/section store reached over the backend REST API.
//!
//! Plain request/response calls; the streaming core only needs reads of the
//! current artifacts and the writes performed by the completion hook.

use serde::de::DeserializeOwned;

use crate::config::ClientConfig;
use crate::errors::{ClientError, StoreError};

/// Stored project record.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub novel_outline: String,
}

/// Stored chapter record.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize)]
pub struct Chapter {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub outline: String,
    #[serde(default)]
    pub order: u32,
}

/// Stored section record.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize)]
pub struct Section {
    pub id: String,
    #[serde(default)]
    pub chapter_id: String,
    pub title: String,
    #[serde(default)]
    pub outline: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub order: u32,
}

/// Partial section update; `None` fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct SectionUpdate {
    pub title: Option<String>,
    pub outline: Option<String>,
    pub content: Option<String>,
}

/// Which list the title-extraction service should produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleKind {
    Chapter,
    Section,
}

/// Store collaborator used by screens and the completion hook.
#[async_trait::async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_project(&self, project: &str) -> Result<Project, StoreError>;
    async fn update_project_outline(&self, project: &str, outline: &str) -> Result<(), StoreError>;
    async fn list_chapters(&self, project: &str) -> Result<Vec<Chapter>, StoreError>;
    async fn get_chapter(&self, project: &str, chapter_id: &str) -> Result<Chapter, StoreError>;
    async fn create_chapter(
        &self,
        project: &str,
        title: &str,
        outline: &str,
    ) -> Result<Chapter, StoreError>;
    async fn update_chapter(
        &self,
        project: &str,
        chapter_id: &str,
        title: &str,
        outline: &str,
    ) -> Result<(), StoreError>;
    async fn list_sections(&self, project: &str, chapter_id: &str)
    -> Result<Vec<Section>, StoreError>;
    async fn get_section(
        &self,
        project: &str,
        chapter_id: &str,
        section_id: &str,
    ) -> Result<Section, StoreError>;
    async fn create_section(
        &self,
        project: &str,
        chapter_id: &str,
        title: &str,
    ) -> Result<Section, StoreError>;
    async fn update_section(
        &self,
        project: &str,
        chapter_id: &str,
        section_id: &str,
        update: &SectionUpdate,
    ) -> Result<(), StoreError>;
    /// Non-streaming call that turns outline text into a title list.
    async fn extract_titles(&self, outline: &str, kind: TitleKind)
    -> Result<Vec<String>, StoreError>;
}

/// `ProjectStore` over the backend's REST endpoints.
pub struct HttpProjectStore {
    client: reqwest::Client,
    config: ClientConfig,
}

#[derive(serde::Deserialize)]
struct TitlesResponse {
    #[serde(default)]
    titles: Vec<String>,
}

impl HttpProjectStore {
    /// Creates a store client from explicit configuration.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a store client using `ClientConfig::from_env`.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }

    fn url(&self, path: &str) -> String {
        self.config.api_url(path)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<String, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transport(format!("{what}: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Transport(format!("{what}: {e}")))?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, StoreError> {
        let body = self.send(request, what).await?;
        serde_json::from_str(&body).map_err(|e| StoreError::Decode(format!("{what}: {e}")))
    }
}

#[async_trait::async_trait]
impl ProjectStore for HttpProjectStore {
    async fn get_project(&self, project: &str) -> Result<Project, StoreError> {
        let req = self.client.get(self.url(&format!("projects/{project}")));
        self.fetch(req, &format!("project {project}")).await
    }

    async fn update_project_outline(&self, project: &str, outline: &str) -> Result<(), StoreError> {
        let req = self
            .client
            .put(self.url(&format!("projects/{project}/outline")))
            .json(&serde_json::json!({ "outline": outline }));
        self.send(req, &format!("project {project}")).await.map(drop)
    }

    async fn list_chapters(&self, project: &str) -> Result<Vec<Chapter>, StoreError> {
        let req = self.client.get(self.url(&format!("projects/{project}/chapters")));
        self.fetch(req, &format!("chapters of {project}")).await
    }

    async fn get_chapter(&self, project: &str, chapter_id: &str) -> Result<Chapter, StoreError> {
        let req = self
            .client
            .get(self.url(&format!("projects/{project}/chapters/{chapter_id}")));
        self.fetch(req, &format!("chapter {chapter_id}")).await
    }

    async fn create_chapter(
        &self,
        project: &str,
        title: &str,
        outline: &str,
    ) -> Result<Chapter, StoreError> {
        let req = self
            .client
            .post(self.url(&format!("projects/{project}/chapters")))
            .json(&serde_json::json!({ "title": title, "outline": outline }));
        self.fetch(req, &format!("new chapter {title}")).await
    }

    async fn update_chapter(
        &self,
        project: &str,
        chapter_id: &str,
        title: &str,
        outline: &str,
    ) -> Result<(), StoreError> {
        let req = self
            .client
            .put(self.url(&format!("projects/{project}/chapters/{chapter_id}")))
            .json(&serde_json::json!({ "title": title, "outline": outline }));
        self.send(req, &format!("chapter {chapter_id}")).await.map(drop)
    }

    async fn list_sections(
        &self,
        project: &str,
        chapter_id: &str,
    ) -> Result<Vec<Section>, StoreError> {
        let req = self
            .client
            .get(self.url(&format!("projects/{project}/chapters/{chapter_id}/sections")));
        self.fetch(req, &format!("sections of {chapter_id}")).await
    }

    async fn get_section(
        &self,
        project: &str,
        chapter_id: &str,
        section_id: &str,
    ) -> Result<Section, StoreError> {
        let req = self.client.get(self.url(&format!(
            "projects/{project}/chapters/{chapter_id}/sections/{section_id}"
        )));
        self.fetch(req, &format!("section {section_id}")).await
    }

    async fn create_section(
        &self,
        project: &str,
        chapter_id: &str,
        title: &str,
    ) -> Result<Section, StoreError> {
        let req = self
            .client
            .post(self.url(&format!("projects/{project}/chapters/{chapter_id}/sections")))
            .json(&serde_json::json!({ "title": title, "outline": "" }));
        self.fetch(req, &format!("new section {title}")).await
    }

    async fn update_section(
        &self,
        project: &str,
        chapter_id: &str,
        section_id: &str,
        update: &SectionUpdate,
    ) -> Result<(), StoreError> {
        let req = self
            .client
            .put(self.url(&format!(
                "projects/{project}/chapters/{chapter_id}/sections/{section_id}"
            )))
            .json(update);
        self.send(req, &format!("section {section_id}")).await.map(drop)
    }

    async fn extract_titles(
        &self,
        outline: &str,
        kind: TitleKind,
    ) -> Result<Vec<String>, StoreError> {
        let req = self
            .client
            .post(self.url("extract-titles"))
            .json(&serde_json::json!({ "outline": outline, "extract_type": kind }));
        let response: TitlesResponse = self.fetch(req, "extract titles").await?;
        Ok(response
            .titles
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_tolerate_missing_optional_fields() {
        let section: Section =
            serde_json::from_str(r#"{"id":"s1","title":"开端"}"#).expect("decode");
        assert_eq!(section.outline, "");
        assert_eq!(section.content, "");
        let chapter: Chapter =
            serde_json::from_str(r#"{"id":"c1","title":"觉醒","order":3,"created_at":"x"}"#)
                .expect("decode");
        assert_eq!(chapter.order, 3);
    }

    #[test]
    fn section_update_serializes_unset_fields_as_null() {
        let update = SectionUpdate {
            content: Some("正文".into()),
            ..SectionUpdate::default()
        };
        let value = serde_json::to_value(&update).expect("serialize");
        assert_eq!(value["content"], "正文");
        assert!(value["outline"].is_null());
    }
}
