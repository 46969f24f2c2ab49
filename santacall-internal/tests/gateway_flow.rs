use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use santacall_internal::config_parser::Config;
use santacall_internal::gateway_util::{build_api_router, setup_ledger, AppStateData};
use santacall_internal::geoblock::GeoblockPolicy;

async fn load_sample_config() -> anyhow::Result<Config> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/santacall.toml");
    Ok(Config::load_and_verify_from_path(&path).await?)
}

async fn send(app: &axum::Router, request: Request<Body>) -> anyhow::Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&bytes)?))
}

#[tokio::test]
async fn test_sample_config_is_valid() -> anyhow::Result<()> {
    let config = load_sample_config().await?;
    assert_eq!(config.quota.max_daily_seconds, 180.0);
    assert!(config.identity.secure_cookie);
    assert!(!config.admin.enabled);
    Ok(())
}

#[tokio::test]
async fn test_visitor_uses_up_daily_allowance() -> anyhow::Result<()> {
    let config = load_sample_config().await?;
    let ledger = setup_ledger(&config, None)?;
    let geoblock = GeoblockPolicy::with_overrides(&config.geoblock, None, None);
    let app = build_api_router(AppStateData::new_with_ledger(
        Arc::new(config),
        ledger,
        geoblock,
        None,
    ))?;

    // First visit issues an identifier cookie
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/check-usage").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let set_cookie = response
        .headers()
        .get("set-cookie")
        .ok_or_else(|| anyhow::anyhow!("missing set-cookie"))?
        .to_str()?
        .to_string();
    assert!(set_cookie.ends_with("; Secure"));
    let cookie = set_cookie
        .split(';')
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty set-cookie"))?
        .to_string();

    for (duration, used, remaining) in [(120, 120.0, 60.0), (90, 180.0, 0.0)] {
        let (status, body) = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/api/record-usage")
                .header("cookie", &cookie)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "durationSeconds": duration }).to_string()))?,
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["usedSeconds"], json!(used));
        assert_eq!(body["remainingSeconds"], json!(remaining));
    }

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/api/check-usage")
            .header("cookie", &cookie)
            .body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["canStart"], json!(false));
    assert_eq!(body["usedSeconds"], json!(180.0));

    // Another visitor is unaffected
    let (_, body) = send(
        &app,
        Request::builder()
            .uri("/api/check-usage")
            .header("cookie", "santa_user_id=someone-else")
            .body(Body::empty())?,
    )
    .await?;
    assert_eq!(body["canStart"], json!(true));
    Ok(())
}
