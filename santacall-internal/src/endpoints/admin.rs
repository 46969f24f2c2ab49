use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppState;
use crate::identity::RequestIdentity;
use crate::usage::day_key::parse_day;
use crate::usage::Clock;

const AVAILABLE_ACTIONS: [&str; 2] = ["clear", "status"];

#[derive(Debug, Default, Deserialize)]
pub struct TestBypassParams {
    pub action: Option<String>,
    /// Defaults to the caller's own identifier
    pub identifier: Option<String>,
    /// `YYYY-MM-DD`, defaults to today. Only used by `clear`.
    pub day: Option<String>,
}

/// Operator route for inspecting or resetting an identifier's usage
pub async fn test_bypass_handler(
    State(app_state): AppState,
    identity: RequestIdentity,
    Query(params): Query<TestBypassParams>,
) -> Result<Response, Error> {
    let identifier = params
        .identifier
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| identity.quota_identifier(&app_state.config.identity));
    let ledger = &app_state.ledger;

    match params.action.as_deref() {
        Some("clear") => {
            let day = match params.day.as_deref() {
                Some(day) => parse_day(day).inspect_err(|e| e.log())?,
                None => ledger.clock().today(),
            };
            let removed = ledger.clear(&identifier, day).await?;
            Ok(Json(json!({
                "success": true,
                "removed": removed,
                "message": format!("Cleared usage for {identifier} on {day}"),
            }))
            .into_response())
        }
        Some("status") => Ok(Json(ledger.status(&identifier).await).into_response()),
        _ => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Invalid action",
                "availableActions": AVAILABLE_ACTIONS,
            })),
        )
            .into_response()),
    }
}

/// Require `Authorization: Bearer <token>` when an admin token is configured
pub async fn require_admin_token(
    State(token): State<Option<Arc<SecretString>>>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let Some(token) = token else {
        return Ok(next.run(request).await);
    };

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|provided| {
            constant_time_eq(provided.trim().as_bytes(), token.expose_secret().as_bytes())
        });

    match authorized {
        Some(true) => {
            info!("Admin request to {}", request.uri().path());
            Ok(next.run(request).await)
        }
        Some(false) => Err(Error::new(ErrorDetails::Unauthorized {
            message: "Invalid admin token".to_string(),
        })),
        None => Err(Error::new(ErrorDetails::Unauthorized {
            message: "Missing bearer token".to_string(),
        })),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
