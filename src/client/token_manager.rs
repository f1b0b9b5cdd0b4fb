use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, RwLock,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tracing::{debug, warn};

use super::{RefreshError, REFRESH_PATH};
use crate::auth::dto::TokenResponse;

type RefreshFuture = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the access token in memory only and coordinates refreshes so that
/// concurrent callers share one network round trip.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    refresh_url: String,
    access_token: RwLock<Option<String>>,
    /// Generation-tagged refresh currently in progress.
    in_flight: Mutex<Option<(u64, RefreshFuture)>>,
    generation: AtomicU64,
}

impl TokenManager {
    /// `http` must carry the cookie store holding the refresh cookie.
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                refresh_url: format!("{}{}", base_url.trim_end_matches('/'), REFRESH_PATH),
                access_token: RwLock::new(None),
                in_flight: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.inner
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, token: Option<String>) {
        self.inner.set(token);
    }

    /// Forget the token and detach any refresh still running; its result
    /// will not be stored.
    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.in_flight) = None;
        self.inner.set(None);
    }

    /// Obtain a new access token. Callers arriving while a refresh is running
    /// await that refresh instead of starting another.
    pub async fn refresh(&self) -> Result<String, RefreshError> {
        let fut = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref() {
                Some((_, fut)) => {
                    debug!("joining in-flight refresh");
                    fut.clone()
                }
                None => {
                    let generation = self.inner.generation.load(Ordering::SeqCst);
                    let inner = Arc::clone(&self.inner);
                    let fut = async move { inner.run_refresh(generation).await }
                        .boxed()
                        .shared();
                    *slot = Some((generation, fut.clone()));
                    fut
                }
            }
        };
        fut.await
    }
}

impl Inner {
    fn set(&self, token: Option<String>) {
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    async fn run_refresh(self: Arc<Self>, generation: u64) -> Result<String, RefreshError> {
        let outcome = self.request_refresh().await;

        let mut slot = lock(&self.in_flight);
        let current = matches!(slot.as_ref(), Some((g, _)) if *g == generation);
        if current {
            // Store before waiters wake so none of them can observe the old token.
            if let Ok(token) = &outcome {
                self.set(Some(token.clone()));
            }
            *slot = None;
        }
        outcome
    }

    async fn request_refresh(&self) -> Result<String, RefreshError> {
        debug!(url = %self.refresh_url, "refreshing access token");
        let res = self
            .http
            .post(&self.refresh_url)
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            warn!(%status, "refresh rejected");
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
            });
        }

        let body: TokenResponse = res
            .json()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        Ok(body.access_token)
    }
}
