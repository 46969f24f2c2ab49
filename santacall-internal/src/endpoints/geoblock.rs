use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::gateway_util::AppState;
use crate::geoblock::GeoDecision;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoblockParams {
    /// Pretend the request comes from this country
    pub test_country: Option<String>,
}

pub async fn check_geoblock_handler(
    State(app_state): AppState,
    Query(params): Query<GeoblockParams>,
    headers: HeaderMap,
) -> Response {
    match app_state
        .geoblock
        .check(params.test_country.as_deref(), &headers)
    {
        GeoDecision::Allowed => Json(json!({ "geoblocked": false })).into_response(),
        GeoDecision::Blocked { country, test_mode } => {
            info!(
                "Geoblocked request from country {country}{}",
                if test_mode { " (test mode)" } else { "" }
            );
            metrics::counter!(
                "santacall_geoblocked_requests_total",
                "test_mode" => test_mode.to_string()
            )
            .increment(1);
            (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "geoblocked",
                    "message": "Service not available in your region",
                })),
            )
                .into_response()
        }
    }
}
