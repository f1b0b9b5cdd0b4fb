use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        cookies,
        dto::{
            HealthResponse, LoginRequest, MeResponse, MessageResponse, RegisterRequest,
            TokenResponse,
        },
        extractors::AuthUser,
        password::{hash_password_blocking, verify_password_blocking},
        repo_types::{CreateUserError, NewUser, User},
    },
    error::AppError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
}

/// Sign a token pair for `user` and package the refresh half as a cookie.
fn start_session(state: &AppState, user: &User) -> Result<(HeaderMap, String), AppError> {
    let pair = state
        .tokens
        .issue_token_pair(user.id, &user.email, &user.name)
        .map_err(|e| {
            error!(error = %e, user_id = %user.id, "token issuance failed");
            AppError::Internal(e.into())
        })?;
    let headers = cookies::setting_headers(
        &pair.refresh_token,
        state.tokens.refresh_ttl(),
        state.config.cookie_secure,
    )?;
    Ok((headers, pair.access_token))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, HeaderMap, Json<TokenResponse>), AppError> {
    let Json(mut payload) = payload?;
    if let Err(e) = payload.validate() {
        warn!(error = %e, "invalid registration input");
        return Err(e);
    }

    // Ensure email is not taken
    if state.users.find_by_email(&payload.email).await?.is_some() {
        warn!(email = %payload.email, "email already registered");
        return Err(AppError::Conflict("Email already registered".into()));
    }

    let hash = hash_password_blocking(payload.password).await?;

    let new_user = NewUser {
        email: &payload.email,
        password_hash: &hash,
        name: &payload.name,
    };
    let user = match state.users.create(new_user).await {
        Ok(u) => u,
        Err(CreateUserError::EmailTaken) => {
            warn!(email = %payload.email, "email registered concurrently");
            return Err(AppError::Conflict("Email already registered".into()));
        }
        Err(CreateUserError::Other(e)) => return Err(AppError::Internal(e)),
    };

    let (headers, access_token) = start_session(&state, &user)?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((
        StatusCode::CREATED,
        headers,
        Json(TokenResponse {
            access_token,
            message: "Registration successful".into(),
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<TokenResponse>), AppError> {
    let Json(mut payload) = payload?;
    payload.validate()?;

    let Some(user) = state.users.find_by_email(&payload.email).await? else {
        warn!(email = %payload.email, "login unknown email");
        return Err(AppError::invalid_credentials());
    };

    if !verify_password_blocking(user.password_hash.clone(), payload.password).await? {
        warn!(email = %payload.email, user_id = %user.id, "login invalid password");
        return Err(AppError::invalid_credentials());
    }

    let (headers, access_token) = start_session(&state, &user)?;

    info!(user_id = %user.id, "user logged in");
    Ok((
        headers,
        Json(TokenResponse {
            access_token,
            message: "Login successful".into(),
        }),
    ))
}

/// Verify the refresh cookie and issue a new pair. Any failure here is
/// answered with a cleared cookie by [`refresh`].
async fn rotate_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(HeaderMap, String), AppError> {
    let invalid = || AppError::Unauthorized("Invalid refresh token".into());

    let Some(token) = cookies::extract_refresh_token(headers) else {
        warn!("refresh cookie missing");
        return Err(invalid());
    };

    let claims = state.tokens.verify_refresh_token(&token).map_err(|_| {
        warn!("refresh token rejected");
        invalid()
    })?;

    let Some(user) = state.users.find_by_id(claims.sub).await? else {
        warn!(user_id = %claims.sub, "refresh for missing user");
        return Err(invalid());
    };

    let session = start_session(state, &user)?;
    info!(user_id = %user.id, "tokens rotated");
    Ok(session)
}

#[instrument(skip(state, headers))]
pub async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match rotate_session(&state, &headers).await {
        Ok((cookie, access_token)) => (
            cookie,
            Json(TokenResponse {
                access_token,
                message: "Tokens refreshed".into(),
            }),
        )
            .into_response(),
        Err(e) => (cookies::clearing_headers(state.config.cookie_secure), e).into_response(),
    }
}

#[instrument(skip(state))]
pub async fn logout(State(state): State<AppState>) -> (HeaderMap, Json<MessageResponse>) {
    (
        cookies::clearing_headers(state.config.cookie_secure),
        Json(MessageResponse {
            message: "Logout successful".into(),
        }),
    )
}

#[instrument(skip_all)]
pub async fn me(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<Json<MeResponse>, AppError> {
    let Some(user) = state.users.find_by_id(claims.sub).await? else {
        warn!(user_id = %claims.sub, "token subject no longer exists");
        return Err(AppError::Unauthorized("Unauthorized".into()));
    };
    Ok(Json(MeResponse { user: user.into() }))
}

#[instrument(skip(state))]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let timestamp = OffsetDateTime::now_utc();
    match state.users.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".into(),
                message: "API is running and database is connected".into(),
                timestamp,
            }),
        ),
        Err(e) => {
            error!(error = ?e, "health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(HealthResponse {
                    status: "error".into(),
                    message: "Database connection failed".into(),
                    timestamp,
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{
            header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE},
            Request,
        },
    };
    use serde_json::{json, Value};
    use time::Duration as TimeDuration;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::repo::memory::MemoryUserStore;

    struct TestApp {
        router: Router,
        store: Arc<MemoryUserStore>,
        state: AppState,
    }

    fn test_app() -> TestApp {
        let store = Arc::new(MemoryUserStore::default());
        let state = AppState::fake(store.clone());
        TestApp {
            router: crate::app::build_app(state.clone()),
            store,
            state,
        }
    }

    struct Reply {
        status: StatusCode,
        headers: HeaderMap,
        body: Value,
    }

    impl Reply {
        fn set_cookie(&self) -> Option<&str> {
            self.headers.get(SET_COOKIE).and_then(|v| v.to_str().ok())
        }

        /// Value of the refresh cookie installed by this response.
        fn refresh_cookie(&self) -> String {
            let raw = self.set_cookie().expect("Set-Cookie present");
            let first = raw.split(';').next().unwrap();
            first.strip_prefix("refreshToken=").unwrap().to_string()
        }

        fn clears_cookie(&self) -> bool {
            self.set_cookie()
                .map(|c| c.starts_with("refreshToken=;") && c.contains("Max-Age=0"))
                .unwrap_or(false)
        }

        fn access_token(&self) -> String {
            self.body["accessToken"].as_str().expect("accessToken").to_string()
        }
    }

    async fn send(app: &TestApp, req: Request<Body>) -> Reply {
        let res = app.router.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Reply {
            status,
            headers,
            body,
        }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_refresh(cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/auth/refresh");
        if let Some(c) = cookie {
            builder = builder.header(COOKIE, format!("refreshToken={c}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn get_me(bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri("/auth/me");
        if let Some(t) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {t}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn register(app: &TestApp, email: &str, password: &str, name: &str) -> Reply {
        send(
            app,
            post_json(
                "/auth/register",
                json!({ "email": email, "password": password, "name": name }),
            ),
        )
        .await
    }

    async fn login(app: &TestApp, email: &str, password: &str) -> Reply {
        send(
            app,
            post_json("/auth/login", json!({ "email": email, "password": password })),
        )
        .await
    }

    #[tokio::test]
    async fn register_then_login_succeeds() {
        let app = test_app();
        let reg = register(&app, "a@x.com", "secret1", "Ann").await;
        assert_eq!(reg.status, StatusCode::CREATED);
        assert_eq!(reg.body["message"], "Registration successful");
        assert!(!reg.access_token().is_empty());
        let cookie = reg.set_cookie().unwrap();
        assert!(cookie.contains("HttpOnly") && cookie.contains("SameSite=Strict"));

        let res = login(&app, "a@x.com", "secret1").await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["message"], "Login successful");
        let claims = app
            .state
            .tokens
            .verify_refresh_token(&res.refresh_cookie())
            .expect("login cookie carries a refresh token");
        assert_eq!(claims.email, "a@x.com");
        assert_eq!(claims.name, "Ann");
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let app = test_app();
        assert_eq!(register(&app, "a@x.com", "secret1", "Ann").await.status, StatusCode::CREATED);

        let again = register(&app, "A@X.com ", "another1", "Annie").await;
        assert_eq!(again.status, StatusCode::CONFLICT);
        assert!(again.set_cookie().is_none());
        assert_eq!(app.store.count().await, 1);
    }

    #[tokio::test]
    async fn invalid_registration_input_is_rejected() {
        let app = test_app();
        assert_eq!(register(&app, "nope", "secret1", "Ann").await.status, StatusCode::BAD_REQUEST);
        assert_eq!(register(&app, "a@x.com", "12345", "Ann").await.status, StatusCode::BAD_REQUEST);
        assert_eq!(register(&app, "a@x.com", "secret1", "").await.status, StatusCode::BAD_REQUEST);

        let malformed = Request::builder()
            .method("POST")
            .uri("/auth/register")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{\"email\":"))
            .unwrap();
        let res = send(&app, malformed).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert!(res.body["error"].is_string());
        assert_eq!(app.store.count().await, 0);
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let app = test_app();
        register(&app, "a@x.com", "secret1", "Ann").await;

        let wrong_password = login(&app, "a@x.com", "secret2").await;
        let unknown_email = login(&app, "nobody@x.com", "secret1").await;

        assert_eq!(wrong_password.status, StatusCode::UNAUTHORIZED);
        assert_eq!(unknown_email.status, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong_password.body, unknown_email.body);
        assert_eq!(wrong_password.body["error"], "Invalid credentials");
        assert!(wrong_password.set_cookie().is_none());
    }

    #[tokio::test]
    async fn refresh_rotates_tokens() {
        let app = test_app();
        let reg = register(&app, "a@x.com", "secret1", "Ann").await;
        let old_cookie = reg.refresh_cookie();

        let res = send(&app, post_refresh(Some(&old_cookie))).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["message"], "Tokens refreshed");
        assert_ne!(res.refresh_cookie(), old_cookie);
        assert!(app.state.tokens.verify_access_token(&res.access_token()).is_ok());
    }

    #[tokio::test]
    async fn refresh_failures_clear_the_cookie() {
        let app = test_app();
        let reg = register(&app, "a@x.com", "secret1", "Ann").await;
        let user_id = app.state.tokens.verify_access_token(&reg.access_token()).unwrap().sub;

        let expired = app
            .state
            .tokens
            .issue_token_pair_at(
                user_id,
                "a@x.com",
                "Ann",
                OffsetDateTime::now_utc() - TimeDuration::days(8),
            )
            .unwrap()
            .refresh_token;
        let mut tampered = reg.refresh_cookie();
        tampered.insert_str(tampered.find('.').unwrap() + 1, "eyJ");
        let access = reg.access_token();

        for cookie in [
            None,
            Some(expired.as_str()),
            Some(tampered.as_str()),
            Some(access.as_str()),
        ] {
            let res = send(&app, post_refresh(cookie)).await;
            assert_eq!(res.status, StatusCode::UNAUTHORIZED, "cookie {cookie:?}");
            assert!(res.clears_cookie(), "cookie {cookie:?}");
            assert_eq!(res.body["error"], "Invalid refresh token");
        }
    }

    #[tokio::test]
    async fn refresh_for_deleted_user_is_rejected() {
        let app = test_app();
        let reg = register(&app, "a@x.com", "secret1", "Ann").await;
        let user_id = app.state.tokens.verify_access_token(&reg.access_token()).unwrap().sub;
        app.store.remove(user_id).await;

        let res = send(&app, post_refresh(Some(&reg.refresh_cookie()))).await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
        assert!(res.clears_cookie());
    }

    #[tokio::test]
    async fn me_requires_a_valid_access_token() {
        let app = test_app();
        let reg = register(&app, "a@x.com", "secret1", "Ann").await;

        assert_eq!(send(&app, get_me(None)).await.status, StatusCode::UNAUTHORIZED);
        assert_eq!(send(&app, get_me(Some("garbage"))).await.status, StatusCode::UNAUTHORIZED);
        // A refresh token is not accepted as a bearer credential.
        assert_eq!(
            send(&app, get_me(Some(&reg.refresh_cookie()))).await.status,
            StatusCode::UNAUTHORIZED
        );

        let basic = Request::builder()
            .uri("/auth/me")
            .header(AUTHORIZATION, "Basic YTpi")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, basic).await.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn me_for_deleted_user_is_rejected() {
        let app = test_app();
        let reg = register(&app, "a@x.com", "secret1", "Ann").await;
        let token = reg.access_token();
        let user_id = app.state.tokens.verify_access_token(&token).unwrap().sub;
        app.store.remove(user_id).await;

        assert_eq!(send(&app, get_me(Some(&token))).await.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_always_clears_cookie() {
        let app = test_app();
        let req = Request::builder()
            .method("POST")
            .uri("/auth/logout")
            .body(Body::empty())
            .unwrap();
        let res = send(&app, req).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["message"], "Logout successful");
        assert!(res.clears_cookie());
    }

    #[tokio::test]
    async fn register_me_logout_refresh_flow() {
        let app = test_app();

        let reg = register(&app, "a@x.com", "secret1", "Ann").await;
        assert_eq!(reg.status, StatusCode::CREATED);
        let token = reg.access_token();
        assert!(reg.set_cookie().unwrap().starts_with("refreshToken=ey"));

        let me = send(&app, get_me(Some(&token))).await;
        assert_eq!(me.status, StatusCode::OK);
        assert_eq!(me.body["user"]["email"], "a@x.com");
        assert_eq!(me.body["user"]["name"], "Ann");
        assert!(me.body["user"]["id"].is_string());
        assert!(me.body["user"]["createdAt"].is_string());

        let logout = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/auth/logout")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert!(logout.clears_cookie());

        // The browser now holds an empty cookie.
        let res = send(&app, post_refresh(Some(""))).await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
        assert!(res.clears_cookie());
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app = test_app();
        let req = Request::builder().uri("/items").body(Body::empty()).unwrap();
        let res = send(&app, req).await;
        assert_eq!(res.status, StatusCode::NOT_FOUND);
        assert_eq!(res.body["error"], "Not found");
    }

    #[tokio::test]
    async fn health_reports_store_status() {
        let app = test_app();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let res = send(&app, req).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["status"], "ok");
    }
}
