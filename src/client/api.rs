use std::{sync::Arc, time::Duration};

use reqwest::{Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::{ClientError, TokenManager, REFRESH_PATH};
use crate::{
    auth::dto::{MeResponse, PublicUser, TokenResponse},
    error::ErrorBody,
};

/// Invoked when a 401 could not be recovered by refreshing; the caller should
/// send the user to the login screen.
pub type SessionExpiredHook = Arc<dyn Fn() + Send + Sync>;

/// API client that attaches the bearer token to every call and, on a 401,
/// refreshes once through the shared [`TokenManager`] and replays the call.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenManager,
    on_session_expired: Option<SessionExpiredHook>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(10))
            .build()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            tokens: TokenManager::new(http.clone(), &base_url),
            http,
            base_url,
            on_session_expired: None,
        })
    }

    pub fn with_session_expired_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_session_expired = Some(Arc::new(hook));
        self
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    async fn send_once<B: Serialize + ?Sized>(
        &self,
        method: &Method,
        path: &str,
        body: Option<&B>,
        token: Option<&str>,
    ) -> Result<Response, reqwest::Error> {
        let mut req = self
            .http
            .request(method.clone(), format!("{}{}", self.base_url, path));
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        if let Some(b) = body {
            req = req.json(b);
        }
        req.send().await
    }

    async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        retry_on_unauthorized: bool,
    ) -> Result<Response, ClientError> {
        let token = self.tokens.get();
        let res = self.send_once(&method, path, body, token.as_deref()).await?;
        if res.status() != StatusCode::UNAUTHORIZED || !retry_on_unauthorized {
            return Ok(res);
        }

        debug!(%method, path, "401 received; refreshing");
        match self.tokens.refresh().await {
            Ok(fresh) => Ok(self.send_once(&method, path, body, Some(&fresh)).await?),
            Err(e) => {
                warn!(error = %e, "refresh failed; session expired");
                self.tokens.clear();
                if let Some(hook) = &self.on_session_expired {
                    hook();
                }
                Err(ClientError::SessionExpired(e))
            }
        }
    }

    /// Send a request through the interceptor. The refresh endpoint itself is
    /// never retried.
    pub async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ClientError> {
        self.execute(method, path, body, path != REFRESH_PATH).await
    }

    pub async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError> {
        let res = self.send(method, path, body).await?;
        decode(res).await
    }

    /// Credential endpoints answer 401 for bad input, which must not be
    /// mistaken for an expired session.
    async fn credential_call(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<TokenResponse, ClientError> {
        let res = self.execute(Method::POST, path, Some(body), false).await?;
        let tokens: TokenResponse = decode(res).await?;
        self.tokens.set(Some(tokens.access_token.clone()));
        Ok(tokens)
    }

    #[instrument(skip(self, password))]
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> Result<TokenResponse, ClientError> {
        self.credential_call(
            "/auth/register",
            &json!({ "email": email, "password": password, "name": name }),
        )
        .await
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenResponse, ClientError> {
        self.credential_call("/auth/login", &json!({ "email": email, "password": password }))
            .await
    }

    /// Best effort: the local token is dropped even if the server call fails.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        match self
            .execute(Method::POST, "/auth/logout", None::<&()>, false)
            .await
        {
            Ok(res) if !res.status().is_success() => {
                warn!(status = %res.status(), "logout call rejected");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "logout call failed"),
        }
        self.tokens.clear();
    }

    pub async fn profile(&self) -> Result<PublicUser, ClientError> {
        let me: MeResponse = self.send_json(Method::GET, "/auth/me", None::<&()>).await?;
        Ok(me.user)
    }

    /// App-start bootstrap: trade the refresh cookie for an access token and
    /// load the profile. Returns `None` when no usable session exists.
    #[instrument(skip(self))]
    pub async fn restore_session(&self) -> Option<PublicUser> {
        if let Err(e) = self.tokens.refresh().await {
            debug!(error = %e, "no session to restore");
            self.tokens.clear();
            return None;
        }
        match self.profile().await {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "profile load after refresh failed");
                self.tokens.clear();
                None
            }
        }
    }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, ClientError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res.json::<T>().await?);
    }
    let message = match res.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("error").to_string(),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}
