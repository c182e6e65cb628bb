use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, Response,
};
use shared::{
    domain::{LocalUser, MessageId, UserId},
    error::{ApiError, ApiException},
    protocol::{MessagePayload, UserSummary},
};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// A message with attachments, sent through `POST /messages/multiple`.
#[derive(Debug, Clone)]
pub struct AttachmentDraft {
    pub from: UserId,
    pub to: UserId,
    pub content: Option<String>,
    pub attachments: Vec<AttachmentUpload>,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_profile(&self) -> Result<LocalUser>;
    async fn list_users(&self) -> Result<Vec<UserSummary>>;
    async fn fetch_history(&self, me: &UserId, peer: &UserId) -> Result<Vec<MessagePayload>>;
    async fn send_attachments(&self, draft: AttachmentDraft) -> Result<Vec<MessagePayload>>;
    async fn delete_message(&self, message_id: &MessageId) -> Result<()>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: String,
    auth_token: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Maps a non-success response to the shared `ApiException`.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let parsed = serde_json::from_str::<ApiError>(&body).ok();
    let err = ApiException::from_response(status.as_u16(), parsed);
    warn!(status = status.as_u16(), code = ?err.code, "api: request failed");
    Err(err.into())
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_profile(&self) -> Result<LocalUser> {
        let response = self
            .http
            .get(self.url("/auth/profile"))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .context("failed to request profile")?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn list_users(&self) -> Result<Vec<UserSummary>> {
        let response = self
            .http
            .get(self.url("/users"))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .context("failed to request contact list")?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn fetch_history(&self, me: &UserId, peer: &UserId) -> Result<Vec<MessagePayload>> {
        let response = self
            .http
            .get(self.url(&format!("/messages/{me}/{peer}")))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .context("failed to request message history")?;
        let history: Vec<MessagePayload> = ensure_success(response).await?.json().await?;
        debug!(peer_id = %peer, messages = history.len(), "api: history loaded");
        Ok(history)
    }

    async fn send_attachments(&self, draft: AttachmentDraft) -> Result<Vec<MessagePayload>> {
        let mut form = Form::new()
            .text("from", draft.from.to_string())
            .text("to", draft.to.to_string());
        if let Some(content) = draft.content {
            form = form.text("content", content);
        }
        for attachment in draft.attachments {
            let mut part = Part::bytes(attachment.bytes).file_name(attachment.filename);
            if let Some(mime_type) = attachment.mime_type {
                part = part
                    .mime_str(&mime_type)
                    .with_context(|| format!("invalid attachment mime type: {mime_type}"))?;
            }
            form = form.part("attachments", part);
        }

        let response = self
            .http
            .post(self.url("/messages/multiple"))
            .bearer_auth(&self.auth_token)
            .multipart(form)
            .send()
            .await
            .context("failed to upload attachments")?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/messages/{message_id}")))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .context("failed to request message deletion")?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
