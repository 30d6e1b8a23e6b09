//! Request/response channel
//!
//! The engine describes the requests it needs as `ApiRequest` values; a
//! `ChatApi` implementation carries them out. `HttpApi` talks JSON over HTTP
//! with a bearer credential on every request.

use async_trait::async_trait;
use log::{debug, error};
use reqwest::{multipart, Client, Response, StatusCode};
use serde_json::json;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::{Contact, UserId, WireMessage};

/// File handed over by the capture/upload layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    FetchHistory { peer_id: UserId },
    SendText { receiver_id: UserId, body: String },
    SendImage { receiver_id: UserId, upload: Upload },
    SendAudio { receiver_id: UserId, upload: Upload },
    DeleteOne { id: u64, delete_for_everyone: bool },
    DeleteMany { ids: Vec<u64>, delete_for_everyone: bool },
    ListContacts,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    History(Vec<WireMessage>),
    Created(WireMessage),
    Deleted,
    Contacts(Vec<Contact>),
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_history(&self, peer_id: UserId) -> Result<Vec<WireMessage>>;
    async fn send_text(&self, receiver_id: UserId, body: &str) -> Result<WireMessage>;
    async fn send_image(&self, receiver_id: UserId, upload: &Upload) -> Result<WireMessage>;
    async fn send_audio(&self, receiver_id: UserId, upload: &Upload) -> Result<WireMessage>;
    async fn delete_message(&self, id: u64, delete_for_everyone: bool) -> Result<()>;
    async fn delete_messages(&self, ids: &[u64], delete_for_everyone: bool) -> Result<()>;
    async fn list_contacts(&self) -> Result<Vec<Contact>>;
}

/// Carry out one request against `api`
pub async fn execute(api: &dyn ChatApi, request: &ApiRequest) -> Result<ApiResponse> {
    match request {
        ApiRequest::FetchHistory { peer_id } => api.fetch_history(*peer_id).await.map(ApiResponse::History),
        ApiRequest::SendText { receiver_id, body } => {
            api.send_text(*receiver_id, body).await.map(ApiResponse::Created)
        }
        ApiRequest::SendImage { receiver_id, upload } => {
            api.send_image(*receiver_id, upload).await.map(ApiResponse::Created)
        }
        ApiRequest::SendAudio { receiver_id, upload } => {
            api.send_audio(*receiver_id, upload).await.map(ApiResponse::Created)
        }
        ApiRequest::DeleteOne { id, delete_for_everyone } => api
            .delete_message(*id, *delete_for_everyone)
            .await
            .map(|_| ApiResponse::Deleted),
        ApiRequest::DeleteMany { ids, delete_for_everyone } => api
            .delete_messages(ids, *delete_for_everyone)
            .await
            .map(|_| ApiResponse::Deleted),
        ApiRequest::ListContacts => api.list_contacts().await.map(ApiResponse::Contacts),
    }
}

pub struct HttpApi {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpApi {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map non-success statuses onto the error taxonomy
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            error!("Request to {} rejected: credential no longer valid", response.url());
            return Err(SyncError::Unauthorized);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("Request failed: {} - {}", status, text);
            return Err(SyncError::Network(format!("HTTP {}: {}", status, text)));
        }
        Ok(response)
    }

    async fn upload(&self, path: &str, field: &str, receiver_id: UserId, upload: &Upload) -> Result<WireMessage> {
        let part = multipart::Part::bytes(upload.bytes.clone())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.mime)?;
        let form = multipart::Form::new()
            .text("receiver_id", receiver_id.to_string())
            .part(field.to_string(), part);

        debug!("Uploading {} ({} bytes) to {}", upload.file_name, upload.bytes.len(), receiver_id);
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn fetch_history(&self, peer_id: UserId) -> Result<Vec<WireMessage>> {
        let response = self
            .http
            .get(self.url(&format!("/conversations/{}/messages", peer_id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn send_text(&self, receiver_id: UserId, body: &str) -> Result<WireMessage> {
        let response = self
            .http
            .post(self.url("/messages"))
            .bearer_auth(&self.token)
            .json(&json!({ "receiver_id": receiver_id, "message": body }))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn send_image(&self, receiver_id: UserId, upload: &Upload) -> Result<WireMessage> {
        self.upload("/messages/images", "image", receiver_id, upload).await
    }

    async fn send_audio(&self, receiver_id: UserId, upload: &Upload) -> Result<WireMessage> {
        self.upload("/messages/audios", "audio", receiver_id, upload).await
    }

    async fn delete_message(&self, id: u64, delete_for_everyone: bool) -> Result<()> {
        let body = if delete_for_everyone {
            json!({ "deleteForEveryone": true })
        } else {
            json!({})
        };
        let response = self
            .http
            .delete(self.url(&format!("/messages/{}", id)))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_messages(&self, ids: &[u64], delete_for_everyone: bool) -> Result<()> {
        let response = self
            .http
            .delete(self.url("/messages"))
            .bearer_auth(&self.token)
            .json(&json!({ "messageIds": ids, "deleteForEveryone": delete_for_everyone }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>> {
        let response = self
            .http
            .get(self.url("/users"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
