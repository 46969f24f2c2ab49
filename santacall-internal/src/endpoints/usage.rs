use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::Error;
use crate::gateway_util::{AppState, StructuredJson};
use crate::identity::{RequestIdentity, COOKIE_SET_HEADER, USER_ID_HEADER};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUsageResponse {
    pub can_start: bool,
    pub remaining_seconds: f64,
    pub used_seconds: f64,
    pub max_daily_seconds: f64,
    /// The store could not be read, so the numbers are defaults and `canStart` is false
    pub degraded: bool,
}

/// Whether the caller may start a call, issuing an identifier cookie on first visit
#[instrument(name = "check_usage", skip_all)]
pub async fn check_usage_handler(
    State(app_state): AppState,
    identity: RequestIdentity,
) -> Result<Response, Error> {
    let (user_id, set_cookie) = identity.user_id_or_issue(&app_state.config.identity)?;
    // Without a cookie the caller's usage was recorded against their IP
    let identifier = identity.quota_identifier(&app_state.config.identity);
    let usage = app_state.ledger.get_usage(&identifier).await;
    let body = CheckUsageResponse {
        can_start: usage.can_start(),
        remaining_seconds: usage.remaining_seconds,
        used_seconds: usage.used_seconds,
        max_daily_seconds: app_state.ledger.max_daily_seconds(),
        degraded: usage.degraded,
    };
    debug!(
        "Usage check for {}: used {}s, remaining {}s, can start: {}",
        redact(&identifier),
        body.used_seconds,
        body.remaining_seconds,
        body.can_start
    );

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&user_id) {
        headers.insert(USER_ID_HEADER, value);
    }
    if let Some(set_cookie) = set_cookie {
        headers.insert(SET_COOKIE, set_cookie);
        headers.insert(COOKIE_SET_HEADER, HeaderValue::from_static("true"));
    }
    Ok((headers, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUsageParams {
    pub duration_seconds: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUsageResponse {
    pub success: bool,
    pub used_seconds: f64,
    pub remaining_seconds: f64,
    pub max_daily_seconds: f64,
}

/// Add the length of a finished call to today's total
#[instrument(name = "record_usage", skip_all)]
pub async fn record_usage_handler(
    State(app_state): AppState,
    identity: RequestIdentity,
    StructuredJson(params): StructuredJson<RecordUsageParams>,
) -> Result<Json<RecordUsageResponse>, Error> {
    let identifier = identity.quota_identifier(&app_state.config.identity);
    let outcome = app_state
        .ledger
        .record_session(&identifier, params.duration_seconds)
        .await?;
    Ok(Json(RecordUsageResponse {
        success: true,
        used_seconds: outcome.used_seconds,
        remaining_seconds: outcome.remaining_seconds,
        max_daily_seconds: app_state.ledger.max_daily_seconds(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveTimeParams {
    pub requested_seconds: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveTimeResponse {
    pub reserved_seconds: f64,
    pub remaining_seconds: f64,
    pub max_daily_seconds: f64,
}

/// How much of the requested call length is available right now. Nothing is held.
#[instrument(name = "reserve_time", skip_all)]
pub async fn reserve_time_handler(
    State(app_state): AppState,
    identity: RequestIdentity,
    StructuredJson(params): StructuredJson<ReserveTimeParams>,
) -> Result<Json<ReserveTimeResponse>, Error> {
    let identifier = identity.quota_identifier(&app_state.config.identity);
    let reservation = app_state
        .ledger
        .reserve_time(&identifier, params.requested_seconds)
        .await?;
    Ok(Json(ReserveTimeResponse {
        reserved_seconds: reservation.reserved_seconds,
        remaining_seconds: reservation.remaining_seconds,
        max_daily_seconds: app_state.ledger.max_daily_seconds(),
    }))
}

/// Identifiers are only partially logged
fn redact(identifier: &str) -> String {
    let prefix: String = identifier.chars().take(20).collect();
    if prefix.len() < identifier.len() {
        format!("{prefix}...")
    } else {
        prefix
    }
}
