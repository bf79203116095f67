//! Row API gateway over HTTP (PostgREST conventions).

use async_trait::async_trait;
use reqwest::{Client as HttpClient, RequestBuilder, StatusCode};
use serde_json::json;

use crate::config::StoreConfig;
use crate::gateway::{GatewayError, GatewayErrorClass, MutationGateway};
use crate::record::{Draft, OwnerId, Record, RecordId};

/// Shared HTTP client for the store's row API.
#[derive(Clone)]
pub struct RestGateway {
    client: HttpClient,
    base_url: String,
    table: String,
    api_key: String,
    access_token: String,
}

impl RestGateway {
    pub fn new(config: &StoreConfig) -> Result<Self, GatewayError> {
        let client = HttpClient::builder()
            .build()
            .map_err(|error| GatewayError::transport(format!("http client init failed: {error}")))?;
        Ok(Self {
            client,
            base_url: config.store_url.clone(),
            table: config.topic.table.clone(),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", self.api_key.as_str())
            .header("accept", "application/json")
            .bearer_auth(self.access_token.as_str())
    }

    async fn send_for_rows(
        &self,
        request: RequestBuilder,
        action: &str,
    ) -> Result<Vec<Record>, GatewayError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|error| GatewayError::transport(format!("{action} request failed: {error}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::new(
                classify_status(status),
                format!(
                    "{action} failed status={} body={}",
                    status.as_u16(),
                    body
                ),
            ));
        }
        let payload = response
            .text()
            .await
            .map_err(|error| GatewayError::transport(format!("{action} body read failed: {error}")))?;
        parse_rows(payload.as_str()).map_err(|error| {
            GatewayError::new(
                GatewayErrorClass::Validation,
                format!("{action} response parse failed: {error}"),
            )
        })
    }
}

#[async_trait]
impl MutationGateway for RestGateway {
    async fn fetch_records(&self, owner: &OwnerId) -> Result<Vec<Record>, GatewayError> {
        let owner_filter = format!("eq.{owner}");
        let request = self.client.get(self.table_url()).query(&[
            ("select", "*"),
            ("user_id", owner_filter.as_str()),
            ("order", "created_at.desc"),
        ]);
        self.send_for_rows(request, "fetch").await
    }

    async fn create(&self, owner: &OwnerId, draft: &Draft) -> Result<Record, GatewayError> {
        let request = self
            .client
            .post(self.table_url())
            .header("content-type", "application/json")
            .header("prefer", "return=representation")
            .json(&json!({
                "title": draft.title(),
                "url": draft.url(),
                "user_id": owner,
            }));
        self.send_for_rows(request, "create")
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                GatewayError::new(
                    GatewayErrorClass::Validation,
                    "create returned no committed row",
                )
            })
    }

    async fn delete(&self, id: RecordId) -> Result<(), GatewayError> {
        let id_filter = format!("eq.{id}");
        let request = self
            .client
            .delete(self.table_url())
            .header("prefer", "return=representation")
            .query(&[("id", id_filter.as_str())]);
        let removed = self.send_for_rows(request, "delete").await?;
        if removed.is_empty() {
            return Err(GatewayError::new(
                GatewayErrorClass::NotFound,
                format!("row {id} does not exist"),
            ));
        }
        Ok(())
    }
}

fn parse_rows(payload: &str) -> Result<Vec<Record>, serde_json::Error> {
    if payload.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<Vec<Record>>(payload)
}

/// A 404 names a missing table or route, never a missing row; row absence
/// is only reported by an empty representation.
fn classify_status(status: StatusCode) -> GatewayErrorClass {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayErrorClass::Auth,
        StatusCode::TOO_MANY_REQUESTS => GatewayErrorClass::RateLimited,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
            GatewayErrorClass::Validation
        }
        s if s.is_server_error() => GatewayErrorClass::Transport,
        _ => GatewayErrorClass::Unknown,
    }
}
