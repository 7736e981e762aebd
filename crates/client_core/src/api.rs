use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Peer, UserId},
    error::ApiException,
    protocol::{
        BlockResponse, ChatMessage, CredentialsRequest, MarkReadRequest, MarkReadResponse,
        PushSubscription, TokenResponse, UserListResponse, ValidateTokenResponse,
    },
};
use tracing::debug;
use url::Url;

/// Session-scoped calls, authenticated with the bearer token.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_users(&self, username_query: Option<&str>) -> Result<Vec<Peer>>;
    async fn history(&self, self_id: &UserId, peer_id: &UserId) -> Result<Vec<ChatMessage>>;
    async fn block(&self, self_id: &UserId, peer_id: &UserId) -> Result<bool>;
    async fn mark_read(&self, sender_id: &UserId, receiver_id: &UserId) -> Result<u64>;
    async fn subscribe_push(&self, subscription: &PushSubscription) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Valid(UserId),
    Revoked,
}

/// Account entry and token validation; these calls run before a session
/// exists.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<String>;
    async fn signup(&self, username: &str, password: &str) -> Result<String>;
    async fn validate_token(&self, token: &str) -> Result<TokenStatus>;
}

fn endpoint(base: &Url, path: &str) -> Result<Url> {
    base.join(path.trim_start_matches('/'))
        .with_context(|| format!("invalid endpoint path '{path}' for base '{base}'"))
}

/// Normalises the base so relative joins keep any path prefix.
fn normalize_base(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(server_url.trim())
        .with_context(|| format!("invalid server url '{server_url}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow!("server_url must start with http:// or https://"));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiException::from_body(status.as_u16(), &body).into())
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = ensure_success(response).await?;
    let url = response.url().clone();
    response
        .json::<T>()
        .await
        .with_context(|| format!("unexpected response body from {url}"))
}

pub struct HttpChatApi {
    http: Client,
    base: Url,
    token: String,
}

impl HttpChatApi {
    pub fn new(server_url: &str, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: Client::new(),
            base: normalize_base(server_url)?,
            token: token.into(),
        })
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_users(&self, username_query: Option<&str>) -> Result<Vec<Peer>> {
        let mut url = endpoint(&self.base, "api/users")?;
        if let Some(query) = username_query {
            url.query_pairs_mut().append_pair("username", query);
        }
        debug!(%url, "listing users");
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        read_json::<UserListResponse>(response).await
    }

    async fn history(&self, self_id: &UserId, peer_id: &UserId) -> Result<Vec<ChatMessage>> {
        let mut url = endpoint(&self.base, "chats")?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot carry path segments"))?
            .push(self_id.as_str())
            .push(peer_id.as_str());
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        read_json(response).await
    }

    async fn block(&self, self_id: &UserId, peer_id: &UserId) -> Result<bool> {
        let mut url = endpoint(&self.base, "chats/block")?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot carry path segments"))?
            .push(self_id.as_str())
            .push(peer_id.as_str());
        let response = self.http.post(url).bearer_auth(&self.token).send().await?;
        let body: BlockResponse = read_json(response).await?;
        Ok(body.success)
    }

    async fn mark_read(&self, sender_id: &UserId, receiver_id: &UserId) -> Result<u64> {
        let url = endpoint(&self.base, "chats/mark-read")?;
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(&MarkReadRequest {
                sender_id: sender_id.clone(),
                receiver_id: receiver_id.clone(),
            })
            .send()
            .await?;
        let body: MarkReadResponse = read_json(response).await?;
        Ok(body.updated_count())
    }

    async fn subscribe_push(&self, subscription: &PushSubscription) -> Result<()> {
        let url = endpoint(&self.base, "subscribe")?;
        debug!(%url, endpoint = %subscription.endpoint, "registering push subscription");
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(subscription)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

pub struct HttpAuthApi {
    http: Client,
    base: Url,
}

impl HttpAuthApi {
    pub fn new(server_url: &str) -> Result<Self> {
        Ok(Self {
            http: Client::new(),
            base: normalize_base(server_url)?,
        })
    }

    async fn post_credentials(&self, path: &str, username: &str, password: &str) -> Result<String> {
        let response = self
            .http
            .post(endpoint(&self.base, path)?)
            .json(&CredentialsRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let body: TokenResponse = read_json(response).await?;
        Ok(body.token)
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, username: &str, password: &str) -> Result<String> {
        self.post_credentials("login", username, password).await
    }

    async fn signup(&self, username: &str, password: &str) -> Result<String> {
        self.post_credentials("create-user", username, password)
            .await
    }

    async fn validate_token(&self, token: &str) -> Result<TokenStatus> {
        let response = self
            .http
            .get(endpoint(&self.base, "validate-token")?)
            .bearer_auth(token)
            .send()
            .await?;
        match read_json::<ValidateTokenResponse>(response).await {
            Ok(body) => body
                .user_id
                .map(TokenStatus::Valid)
                .ok_or_else(|| anyhow!("invalid token: validation response has no userId")),
            Err(err)
                if err
                    .downcast_ref::<ApiException>()
                    .is_some_and(ApiException::is_forbidden) =>
            {
                Ok(TokenStatus::Revoked)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
