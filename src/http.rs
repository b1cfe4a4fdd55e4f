//! HTTP surface: the charge gate for operation handlers plus admin reporting.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::cache::{AuthorizedKey, KeyValidation, UnauthorizedReason};
use crate::clock;
use crate::error::{MeterError, StoreError};
use crate::limits::RateLimitDecision;
use crate::meter::{ChargeOutcome, ChargeRequest, Meter};
use crate::money::UsdMicros;
use crate::store::{AccountStore, MeterStore};
use crate::types::{Permissions, Tier};

pub struct MeterHttpState<S> {
    meter: Arc<Meter<S>>,
    admin_token: Option<String>,
}

impl<S> Clone for MeterHttpState<S> {
    fn clone(&self) -> Self {
        Self {
            meter: Arc::clone(&self.meter),
            admin_token: self.admin_token.clone(),
        }
    }
}

impl<S: MeterStore> MeterHttpState<S> {
    pub fn new(meter: Arc<Meter<S>>) -> Self {
        Self {
            meter,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.trim().is_empty()).then_some(token);
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    balance: Option<UsdMicros>,
    #[serde(skip_serializing_if = "Option::is_none")]
    free_operations_remaining: Option<u32>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
            balance: None,
            free_operations_remaining: None,
        }),
    )
}

fn internal_error() -> ApiError {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "internal error",
    )
}

fn map_store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound(what) => {
            error_response(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
        }
        StoreError::Conflict(what) => error_response(StatusCode::CONFLICT, "conflict", what),
        StoreError::Invalid(reason) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", reason)
        }
        other => {
            error!(error = %other, "admin request failed");
            internal_error()
        }
    }
}

fn map_meter_error(err: MeterError) -> ApiError {
    match err {
        MeterError::Store(err) => map_store_error(err),
        other => {
            error!(error = %other, "admin request failed");
            internal_error()
        }
    }
}

fn unauthorized_response(reason: &UnauthorizedReason) -> ApiError {
    let status = match reason {
        UnauthorizedReason::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        UnauthorizedReason::UnknownOperation { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::UNAUTHORIZED,
    };
    error_response(status, reason.code(), reason.message())
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[derive(Debug, Default, Deserialize)]
struct ApiKeyQuery {
    #[serde(default)]
    api_key: Option<String>,
}

fn extract_api_key(headers: &HeaderMap, query: &ApiKeyQuery) -> String {
    extract_header(headers, "x-api-key")
        .or_else(|| extract_bearer(headers))
        .or_else(|| query.api_key.clone())
        .unwrap_or_default()
}

fn ensure_admin<S>(state: &MeterHttpState<S>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin auth not configured",
        ));
    };
    let provided = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided == expected {
        Ok(())
    } else {
        Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid admin token",
        ))
    }
}

pub fn router<S: MeterStore>(state: MeterHttpState<S>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/v1/charge", post(handle_charge::<S>))
        .route("/v1/balance", get(handle_balance::<S>))
        .route("/v1/eligibility", get(handle_eligibility::<S>));

    if state.admin_token.is_some() {
        router = router
            .route(
                "/admin/accounts",
                get(list_accounts::<S>).post(create_account::<S>),
            )
            .route("/admin/accounts/:id", get(get_account::<S>))
            .route(
                "/admin/accounts/:id/transactions",
                get(list_transactions::<S>),
            )
            .route("/admin/accounts/:id/usage", get(account_usage::<S>))
            .route("/admin/accounts/:id/credits", post(credit_account::<S>))
            .route(
                "/admin/accounts/:id/keys",
                get(list_keys::<S>).post(issue_key::<S>),
            )
            .route("/admin/keys/:key", delete(revoke_key::<S>))
            .route("/admin/usage", get(usage_report::<S>))
            .route("/admin/metrics", get(metrics::<S>));
    }

    router.with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Deserialize)]
struct ChargeBody {
    operation: String,
    #[serde(default)]
    idempotency_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChargeResponse {
    status: &'static str,
    account_id: String,
    operation: String,
    used_free: bool,
    free_operations_remaining: u32,
    balance: UsdMicros,
    cost: UsdMicros,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id: Option<i64>,
    replayed: bool,
}

fn rate_limit_headers(decision: &RateLimitDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    if let Some(limit) = decision.limit {
        put("x-ratelimit-limit", limit.to_string());
    }
    if let Some(remaining) = decision.remaining {
        put("x-ratelimit-remaining", remaining.to_string());
    }
    if let Some(reset_at_ms) = decision.reset_at_ms {
        put("x-ratelimit-reset", (reset_at_ms / 1000).to_string());
    }
    headers
}

fn charge_response(outcome: ChargeOutcome) -> Response {
    match outcome {
        ChargeOutcome::Charged(receipt) => Json(ChargeResponse {
            status: "charged",
            account_id: receipt.account_id,
            operation: receipt.operation,
            used_free: receipt.used_free,
            free_operations_remaining: receipt.free_remaining,
            balance: receipt.balance,
            cost: receipt.cost,
            transaction_id: receipt.transaction_id,
            replayed: receipt.replayed,
        })
        .into_response(),
        ChargeOutcome::Unauthorized(reason) => unauthorized_response(&reason).into_response(),
        ChargeOutcome::RateLimited(decision) => (
            rate_limit_headers(&decision),
            error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "request rate limit exceeded",
            ),
        )
            .into_response(),
        ChargeOutcome::TierLimitExceeded { tier, limit, used } => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "tier_limit_exceeded",
            format!("{tier} tier allows {limit} operations per month, {used} used"),
        )
        .into_response(),
        ChargeOutcome::Declined {
            balance,
            free_remaining,
            ..
        } => {
            let (status, Json(mut body)) = error_response(
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_funds",
                "free operations exhausted and balance too low",
            );
            body.balance = Some(balance);
            body.free_operations_remaining = Some(free_remaining);
            (status, Json(body)).into_response()
        }
        ChargeOutcome::InternalError => internal_error().into_response(),
    }
}

async fn handle_charge<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    Query(query): Query<ApiKeyQuery>,
    headers: HeaderMap,
    Json(body): Json<ChargeBody>,
) -> Response {
    let idempotency_token = body
        .idempotency_token
        .or_else(|| extract_header(&headers, "idempotency-key"));
    let request = ChargeRequest {
        api_key: extract_api_key(&headers, &query),
        operation: body.operation,
        idempotency_token,
    };
    charge_response(state.meter.charge(request).await)
}

fn authorized_or_reject(
    validation: Result<KeyValidation, StoreError>,
    context: &'static str,
) -> Result<AuthorizedKey, ApiError> {
    match validation {
        Ok(KeyValidation::Authorized(authorized)) => Ok(authorized),
        Ok(KeyValidation::Unauthorized(reason)) => Err(unauthorized_response(&reason)),
        Ok(KeyValidation::Expired) => Err(unauthorized_response(&UnauthorizedReason::Expired)),
        Err(err) => {
            error!(error = %err, "{context} failed");
            Err(internal_error())
        }
    }
}

fn account_not_found() -> ApiError {
    error_response(StatusCode::NOT_FOUND, "not_found", "account not found")
}

async fn handle_balance<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    Query(query): Query<ApiKeyQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let api_key = extract_api_key(&headers, &query);
    let authorized =
        authorized_or_reject(state.meter.cache().authenticate(&api_key).await, "balance lookup")?;
    let info = state
        .meter
        .ledger()
        .balance_info(&authorized.account_id)
        .await
        .map_err(map_store_error)?
        .ok_or_else(account_not_found)?;
    Ok(Json(info).into_response())
}

#[derive(Debug, Deserialize)]
struct EligibilityQuery {
    operation: String,
    #[serde(default)]
    api_key: Option<String>,
}

/// Answers whether the key's account could run `operation` now. Charges
/// nothing and does not count against the rate limit.
async fn handle_eligibility<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    Query(query): Query<EligibilityQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let operation = query.operation.trim();
    if !state.meter.is_meterable(operation) {
        return Err(unauthorized_response(&UnauthorizedReason::UnknownOperation {
            operation: operation.to_string(),
        }));
    }
    let api_key = extract_api_key(
        &headers,
        &ApiKeyQuery {
            api_key: query.api_key.clone(),
        },
    );
    let authorized = authorized_or_reject(
        state.meter.cache().validate(&api_key, operation).await,
        "eligibility check",
    )?;
    let eligibility = state
        .meter
        .ledger()
        .can_perform(&authorized.account_id, operation)
        .await
        .map_err(map_store_error)?
        .ok_or_else(account_not_found)?;
    Ok(Json(eligibility).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateAccountBody {
    id: String,
    #[serde(default)]
    tier: Tier,
}

async fn create_account<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    headers: HeaderMap,
    Json(body): Json<CreateAccountBody>,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;
    let id = body.id.trim();
    if id.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "account id must not be empty",
        ));
    }
    let account = state
        .meter
        .create_account(id, body.tier)
        .await
        .map_err(map_meter_error)?;
    Ok((StatusCode::CREATED, Json(account)).into_response())
}

async fn list_accounts<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;
    let accounts = state
        .meter
        .store()
        .list_accounts()
        .await
        .map_err(map_store_error)?;
    Ok(Json(accounts).into_response())
}

async fn get_account<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;
    let info = state
        .meter
        .ledger()
        .balance_info(&id)
        .await
        .map_err(map_store_error)?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "not_found", "account not found"))?;
    Ok(Json(info).into_response())
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_transactions<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let transactions = state
        .meter
        .store()
        .list_transactions(&id, limit)
        .await
        .map_err(map_store_error)?;
    Ok(Json(transactions).into_response())
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    #[serde(default)]
    since_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct AccountUsageResponse {
    account_id: String,
    since_ms: u64,
    total: u64,
    by_operation: std::collections::BTreeMap<String, u64>,
}

async fn account_usage<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    Path(id): Path<String>,
    Query(query): Query<SinceQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;
    let since_ms = query
        .since_ms
        .unwrap_or_else(|| clock::month_start(state.meter.now_millis()));
    let usage = state.meter.usage();
    let total = usage
        .total_for_cycle(&id, since_ms)
        .await
        .map_err(map_store_error)?;
    let by_operation = usage
        .breakdown_by_operation(&id, since_ms)
        .await
        .map_err(map_store_error)?;
    Ok(Json(AccountUsageResponse {
        account_id: id,
        since_ms,
        total,
        by_operation,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
struct CreditBody {
    amount: UsdMicros,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    payment_ref: Option<String>,
}

async fn credit_account<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreditBody>,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;
    let record = state
        .meter
        .ledger()
        .credit(&id, body.amount, body.description, body.payment_ref)
        .await
        .map_err(map_store_error)?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

#[derive(Debug, Serialize)]
struct ApiKeySummary {
    key_prefix: String,
    name: Option<String>,
    permissions: Permissions,
    expires_at_ms: Option<u64>,
    revoked_at_ms: Option<u64>,
    last_used_at_ms: Option<u64>,
    created_at_ms: u64,
}

async fn list_keys<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;
    let keys = state
        .meter
        .store()
        .list_api_keys(&id)
        .await
        .map_err(map_store_error)?;
    let keys: Vec<ApiKeySummary> = keys
        .into_iter()
        .map(|record| ApiKeySummary {
            key_prefix: record.key.chars().take(10).collect(),
            name: record.name,
            permissions: record.permissions,
            expires_at_ms: record.expires_at_ms,
            revoked_at_ms: record.revoked_at_ms,
            last_used_at_ms: record.last_used_at_ms,
            created_at_ms: record.created_at_ms,
        })
        .collect();
    Ok(Json(keys).into_response())
}

#[derive(Debug, Deserialize)]
struct IssueKeyBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "wildcard_permissions")]
    permissions: Permissions,
    #[serde(default)]
    expires_at_ms: Option<u64>,
}

fn wildcard_permissions() -> Permissions {
    Permissions::All
}

async fn issue_key<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<IssueKeyBody>,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;
    let record = state
        .meter
        .issue_api_key(&id, body.name, body.permissions, body.expires_at_ms)
        .await
        .map_err(map_meter_error)?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

async fn revoke_key<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;
    let revoked = state
        .meter
        .revoke_api_key(&key)
        .await
        .map_err(map_meter_error)?;
    if !revoked {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            "api key not found",
        ));
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    #[serde(default)]
    days: Option<u32>,
}

async fn usage_report<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    Query(query): Query<ReportQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;
    let days = query.days.unwrap_or(30).clamp(1, 366);
    let accounts = state
        .meter
        .store()
        .list_accounts()
        .await
        .map_err(map_store_error)?;
    let report = state
        .meter
        .usage()
        .report(days, &accounts)
        .await
        .map_err(map_store_error)?;
    Ok(Json(report).into_response())
}

async fn metrics<S: MeterStore>(
    State(state): State<MeterHttpState<S>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;
    Ok(Json(state.meter.observability()).into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    use super::*;
    use crate::config::MeterConfig;
    use crate::store::MemoryStore;

    #[test]
    fn bearer_and_header_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer  tok "));
        assert_eq!(extract_bearer(&headers).as_deref(), Some("tok"));

        headers.insert("x-api-key", HeaderValue::from_static("sk_header"));
        let query = ApiKeyQuery {
            api_key: Some("sk_query".to_string()),
        };
        assert_eq!(extract_api_key(&headers, &query), "sk_header");
        assert_eq!(extract_api_key(&HeaderMap::new(), &query), "sk_query");
    }

    fn app_with_admin() -> Router {
        let meter = Arc::new(Meter::new(
            Arc::new(MemoryStore::new()),
            MeterConfig::default(),
        ));
        router(MeterHttpState::new(meter).with_admin_token("admin-secret"))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json")
        };
        (status, value)
    }

    fn admin_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", "Bearer admin-secret")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn charge_request(key: &str, operation: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/charge")
            .header("x-api-key", key)
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "operation": operation }).to_string(),
            ))
            .expect("request")
    }

    #[tokio::test]
    async fn admin_rejects_wrong_token() {
        let app = app_with_admin();
        let request = Request::builder()
            .uri("/admin/accounts")
            .header("x-admin-token", "nope")
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn charge_flow_over_http() {
        let app = app_with_admin();

        let (status, _) = send(
            &app,
            admin_post("/admin/accounts", serde_json::json!({ "id": "acct_1" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(
            &app,
            admin_post("/admin/accounts", serde_json::json!({ "id": "acct_1" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, issued) = send(
            &app,
            admin_post(
                "/admin/accounts/acct_1/keys",
                serde_json::json!({ "permissions": ["compress"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let key = issued["key"].as_str().expect("key").to_string();
        assert!(key.starts_with("sk_"));

        let (status, body) = send(&app, charge_request(&key, "compress")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "charged");
        assert_eq!(body["used_free"], true);

        let (status, body) = send(&app, charge_request(&key, "merge")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "permission_denied");

        let (status, _) = send(&app, charge_request("sk_unknown", "compress")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, record) = send(
            &app,
            admin_post(
                "/admin/accounts/acct_1/credits",
                serde_json::json!({ "amount": "5.00" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(record["description"], "Deposit");

        let balance_request = Request::builder()
            .uri("/v1/balance")
            .header("authorization", format!("Bearer {key}"))
            .body(Body::empty())
            .expect("request");
        let (status, info) = send(&app, balance_request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["account_id"], "acct_1");
        assert_eq!(info["free_operations_used"], 1);

        let revoke = Request::builder()
            .method("DELETE")
            .uri(format!("/admin/keys/{key}"))
            .header("authorization", "Bearer admin-secret")
            .body(Body::empty())
            .expect("request");
        let (status, _) = send(&app, revoke).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, charge_request(&key, "compress")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "revoked_api_key");
    }

    fn eligibility_request(key: &str, operation: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("/v1/eligibility?operation={operation}"))
            .header("x-api-key", key)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn eligibility_reports_without_charging() {
        let meter = Arc::new(Meter::new(
            Arc::new(MemoryStore::new()),
            MeterConfig {
                free_monthly_quota: 1,
                ..MeterConfig::default()
            },
        ));
        let app = router(MeterHttpState::new(meter).with_admin_token("admin-secret"));
        send(
            &app,
            admin_post("/admin/accounts", serde_json::json!({ "id": "acct_e" })),
        )
        .await;
        let (_, issued) = send(
            &app,
            admin_post("/admin/accounts/acct_e/keys", serde_json::json!({})),
        )
        .await;
        let key = issued["key"].as_str().expect("key").to_string();

        for _ in 0..2 {
            let (status, body) = send(&app, eligibility_request(&key, "compress")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["can_perform"], true);
            assert_eq!(body["free_operations_remaining"], 1);
            assert_eq!(body["unit_cost"], "0.005");
        }

        let (status, _) = send(&app, charge_request(&key, "compress")).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(&app, eligibility_request(&key, "compress")).await;
        assert_eq!(body["can_perform"], false);
        assert_eq!(body["has_balance"], false);

        let (status, _) = send(
            &app,
            admin_post(
                "/admin/accounts/acct_e/credits",
                serde_json::json!({ "amount": 5 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, body) = send(&app, eligibility_request(&key, "compress")).await;
        assert_eq!(body["can_perform"], true);
        assert_eq!(body["balance"], "5.00");

        let (status, body) = send(&app, eligibility_request(&key, "mine-bitcoin")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "unknown_operation");

        let (status, _) = send(&app, eligibility_request("sk_unknown", "compress")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_routes_are_absent_without_token() {
        let meter = Arc::new(Meter::new(
            Arc::new(MemoryStore::new()),
            MeterConfig::default(),
        ));
        let app = router(MeterHttpState::new(meter));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/metrics")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
