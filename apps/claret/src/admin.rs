use std::collections::BTreeSet;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde::Deserialize;
use tracing::info;

use claret_accounts::{Account, AccountPatch, Capability};
use claret_common::{AccountId, ProxyError, Settings};

use crate::state::{AppState, persist_settings};

/// `/health` lives outside the `/api/admin` prefix but belongs to the same
/// key set as the rest of the admin surface.
pub fn health_router(state: Arc<AppState>) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

async fn health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize_admin(&state, &headers) {
        return error_response(&err);
    }
    axum::Json(serde_json::json!({"status": "ok"})).into_response()
}

pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/accounts", get(list_accounts).post(create_account))
        .route(
            "/accounts/{id}",
            put(update_account).delete(delete_account),
        )
        .route("/accounts/import", post(import_accounts))
        .route("/accounts/oauth/exchange", post(oauth_exchange))
        .route("/accounts/{id}/reauthenticate", post(reauthenticate))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/statistics", get(statistics))
        .with_state(state)
}

fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ProxyError> {
    let settings = state.services.settings.load();
    let presented = headers
        .get("x-admin-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::to_string)
        });
    match presented {
        Some(key) if settings.admin_keys.iter().any(|k| *k == key) => Ok(()),
        _ => Err(ProxyError::Unauthorized),
    }
}

fn error_response(err: &ProxyError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(err.body())).into_response()
}

/// Secrets never leave through the admin API; accounts are summarized.
fn account_view(account: &Account) -> serde_json::Value {
    serde_json::json!({
        "organization_uuid": account.organization_uuid,
        "auth_kind": account.auth_kind(),
        "capabilities": account.capabilities,
        "preferred_auth": account.preferred_auth,
        "cooldowns": account.cooldowns,
        "usage_count": account.usage_count,
        "last_used_at": account.last_used_at,
        "oauth_invalid": account.oauth_invalid,
        "created_at": account.created_at,
        "updated_at": account.updated_at,
    })
}

async fn list_accounts(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize_admin(&state, &headers) {
        return error_response(&err);
    }
    let accounts = state.services.store.list().await;
    let views: Vec<_> = accounts.iter().map(account_view).collect();
    axum::Json(views).into_response()
}

#[derive(Debug, Deserialize)]
struct CreateAccountBody {
    cookie_value: String,
}

async fn create_account(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<CreateAccountBody>,
) -> Response {
    if let Err(err) = authorize_admin(&state, &headers) {
        return error_response(&err);
    }
    match state
        .services
        .oauth
        .bootstrap_cookie_account(&body.cookie_value)
        .await
    {
        Ok(account) => {
            info!(event = "account_bootstrapped", account = %account.organization_uuid);
            (StatusCode::CREATED, axum::Json(account_view(&account))).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn update_account(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<AccountId>,
    axum::Json(patch): axum::Json<AccountPatch>,
) -> Response {
    if let Err(err) = authorize_admin(&state, &headers) {
        return error_response(&err);
    }
    match state
        .services
        .store
        .update(id, |account| patch.clone().apply(account))
        .await
    {
        Ok(account) => axum::Json(account_view(&account)).into_response(),
        Err(err) => error_response(&ProxyError::InvalidRequest(err.to_string())),
    }
}

async fn delete_account(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<AccountId>,
) -> Response {
    if let Err(err) = authorize_admin(&state, &headers) {
        return error_response(&err);
    }
    match state.services.store.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&ProxyError::InvalidRequest(err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct ImportBody {
    cookies: Vec<String>,
}

async fn import_accounts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<ImportBody>,
) -> Response {
    if let Err(err) = authorize_admin(&state, &headers) {
        return error_response(&err);
    }
    let mut results = Vec::new();
    for cookie in &body.cookies {
        match state.services.oauth.bootstrap_cookie_account(cookie).await {
            Ok(account) => results.push(serde_json::json!({
                "ok": true,
                "organization_uuid": account.organization_uuid,
            })),
            Err(err) => results.push(serde_json::json!({
                "ok": false,
                "error": err.to_string(),
            })),
        }
    }
    axum::Json(results).into_response()
}

#[derive(Debug, Deserialize)]
struct OAuthExchangeBody {
    #[serde(default)]
    organization: Option<AccountId>,
    code: String,
    pkce_verifier: String,
    #[serde(default)]
    capabilities: BTreeSet<Capability>,
}

async fn oauth_exchange(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<OAuthExchangeBody>,
) -> Response {
    if let Err(err) = authorize_admin(&state, &headers) {
        return error_response(&err);
    }
    match state
        .services
        .oauth
        .exchange_from_code(
            body.organization,
            &body.code,
            &body.pkce_verifier,
            body.capabilities,
        )
        .await
    {
        Ok(account) => (StatusCode::CREATED, axum::Json(account_view(&account))).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn reauthenticate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<AccountId>,
) -> Response {
    if let Err(err) = authorize_admin(&state, &headers) {
        return error_response(&err);
    }
    match state.services.oauth.exchange_from_cookie(id).await {
        Ok(account) => axum::Json(account_view(&account)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn get_settings(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize_admin(&state, &headers) {
        return error_response(&err);
    }
    axum::Json(state.services.settings.load_full().as_ref().clone()).into_response()
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::Json(settings): axum::Json<Settings>,
) -> Response {
    if let Err(err) = authorize_admin(&state, &headers) {
        return error_response(&err);
    }
    state.services.settings.store(Arc::new(settings));
    persist_settings(&state).await;
    info!(event = "settings_updated");
    axum::Json(state.services.settings.load_full().as_ref().clone()).into_response()
}

async fn statistics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize_admin(&state, &headers) {
        return error_response(&err);
    }
    let accounts = state.services.store.list().await;
    let per_account: Vec<_> = accounts
        .iter()
        .map(|account| {
            serde_json::json!({
                "organization_uuid": account.organization_uuid,
                "usage_count": account.usage_count,
                "last_used_at": account.last_used_at,
                "active_cooldowns": account.cooldowns.len(),
            })
        })
        .collect();
    axum::Json(serde_json::json!({
        "requests": state.stats.snapshot(),
        "accounts": per_account,
    }))
    .into_response()
}
