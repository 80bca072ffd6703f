//! Client for the external system of record.

use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use super::time::format_source_time;
use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::models::{ChangeNotification, EntityKind, LabResultDocument, StreamCursor};

#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// One page of changed entities for `entity`.
    async fn list_changed(
        &self,
        entity: EntityKind,
        cursor: &StreamCursor,
    ) -> Result<Vec<ChangeNotification>, SourceError>;

    async fn subscription_active(&self, entity: EntityKind) -> Result<bool, SourceError>;

    /// Subscribe to change events; a no-op if already subscribed.
    async fn subscribe(&self, entity: EntityKind) -> Result<(), SourceError>;

    async fn lab_result(
        &self,
        patient_id: &str,
        lab_result_id: &str,
    ) -> Result<LabResultDocument, SourceError>;

    /// Resolve the encounter a lab result (or its order) belongs to.
    async fn encounter_for_lab_result(&self, id: &str) -> Result<String, SourceError>;
}

#[derive(Deserialize)]
struct ListChangedResponse {
    #[serde(default)]
    results: Vec<ChangeNotification>,
}

#[derive(Deserialize)]
struct SubscriptionStatus {
    active: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncounterLookup {
    encounter_id: Option<String>,
}

pub struct HttpChangeSource {
    client: Client,
    base_url: String,
    api_token: String,
    timezone: Tz,
}

impl HttpChangeSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        info!(base_url = %config.base_url, timezone = %config.timezone, "Source client created");

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            timezone: config.timezone,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        if self.api_token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.api_token)
        }
    }

    fn cursor_query(&self, cursor: &StreamCursor) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("offset", cursor.offset.to_string()),
            ("leaveUnprocessed", cursor.leave_unprocessed.to_string()),
        ];
        if let Some(start) = cursor.start_time {
            query.push(("startTime", format_source_time(start, self.timezone)));
        }
        if let Some(end) = cursor.end_time {
            query.push(("endTime", format_source_time(end, self.timezone)));
        }
        if let Some(limit) = cursor.limit {
            query.push(("limit", limit.to_string()));
        }
        query
    }
}

async fn check(response: Response, what: &str) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(SourceError::NotFound(what.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    Err(SourceError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ChangeSource for HttpChangeSource {
    async fn list_changed(
        &self,
        entity: EntityKind,
        cursor: &StreamCursor,
    ) -> Result<Vec<ChangeNotification>, SourceError> {
        let response = self
            .authorized(
                self.client
                    .get(self.url(&format!("{}/changed", entity.api_path())))
                    .query(&self.cursor_query(cursor)),
            )
            .send()
            .await?;

        let page: ListChangedResponse = check(response, "changed list").await?.json().await?;
        debug!(
            stream = %entity,
            offset = cursor.offset,
            count = page.results.len(),
            "Fetched change page"
        );
        Ok(page.results)
    }

    async fn subscription_active(&self, entity: EntityKind) -> Result<bool, SourceError> {
        let response = self
            .authorized(
                self.client
                    .get(self.url(&format!("{}/subscription", entity.api_path()))),
            )
            .send()
            .await?;

        let status: SubscriptionStatus = check(response, "subscription").await?.json().await?;
        Ok(status.active)
    }

    async fn subscribe(&self, entity: EntityKind) -> Result<(), SourceError> {
        let response = self
            .authorized(
                self.client
                    .post(self.url(&format!("{}/subscription", entity.api_path()))),
            )
            .send()
            .await?;

        check(response, "subscription").await?;
        info!(stream = %entity, "Subscribed to source change events");
        Ok(())
    }

    async fn lab_result(
        &self,
        patient_id: &str,
        lab_result_id: &str,
    ) -> Result<LabResultDocument, SourceError> {
        let response = self
            .authorized(self.client.get(self.url(&format!(
                "patients/{}/lab-results/{}",
                patient_id, lab_result_id
            ))))
            .send()
            .await?;

        let what = format!("lab result {}", lab_result_id);
        Ok(check(response, &what).await?.json().await?)
    }

    async fn encounter_for_lab_result(&self, id: &str) -> Result<String, SourceError> {
        let response = self
            .authorized(
                self.client
                    .get(self.url(&format!("lab-results/{}/encounter", id))),
            )
            .send()
            .await?;

        let what = format!("encounter for lab result {}", id);
        let lookup: EncounterLookup = check(response, &what).await?.json().await?;
        lookup
            .encounter_id
            .filter(|e| !e.is_empty())
            .ok_or(SourceError::NotFound(what))
    }
}
