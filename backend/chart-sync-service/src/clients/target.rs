//! Client for the downstream encounter notes system.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TargetConfig;
use crate::error::TargetError;

#[async_trait]
pub trait NotesTarget: Send + Sync {
    /// Current discussion notes of an encounter; empty if none exist.
    async fn discussion_notes(&self, encounter_id: &str) -> Result<String, TargetError>;

    /// Write notes. With `replace` the content overwrites the notes,
    /// otherwise it is appended to them.
    async fn update_discussion_notes(
        &self,
        encounter_id: &str,
        content: &str,
        replace: bool,
    ) -> Result<(), TargetError>;
}

#[derive(Deserialize)]
struct NotesResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct NotesUpdate<'a> {
    content: &'a str,
    replace: bool,
}

pub struct HttpNotesTarget {
    client: Client,
    base_url: String,
    api_token: String,
}

impl HttpNotesTarget {
    pub fn new(config: &TargetConfig) -> Result<Self, TargetError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn notes_url(&self, encounter_id: &str) -> String {
        format!("{}/encounters/{}/discussion-notes", self.base_url, encounter_id)
    }
}

async fn check(response: Response) -> Result<Response, TargetError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TargetError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl NotesTarget for HttpNotesTarget {
    async fn discussion_notes(&self, encounter_id: &str) -> Result<String, TargetError> {
        let response = self
            .client
            .get(self.notes_url(encounter_id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        let notes: NotesResponse = check(response).await?.json().await?;
        Ok(notes.content.unwrap_or_default())
    }

    async fn update_discussion_notes(
        &self,
        encounter_id: &str,
        content: &str,
        replace: bool,
    ) -> Result<(), TargetError> {
        let response = self
            .client
            .put(self.notes_url(encounter_id))
            .bearer_auth(&self.api_token)
            .json(&NotesUpdate { content, replace })
            .send()
            .await?;

        check(response).await?;
        debug!(encounter_id, replace, "Discussion notes updated");
        Ok(())
    }
}
