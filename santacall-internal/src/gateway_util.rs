use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Json, Request};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, SET_COOKIE};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::get;
use axum::routing::post;
use axum::Router;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::instrument;

use crate::config_parser::Config;
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::geoblock::GeoblockPolicy;
use crate::identity::{COOKIE_SET_HEADER, USER_ID_HEADER};
use crate::usage::{DurableBackend, MemoryUsageStore, RedisConnector, SystemClock, UsageLedger};

/// State for the API routes
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub ledger: Arc<UsageLedger>,
    pub geoblock: Arc<GeoblockPolicy>,
    /// Bearer token required by the admin routes, if any
    pub admin_token: Option<Arc<SecretString>>,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub fn new(config: Arc<Config>) -> Result<Self, Error> {
        let redis_url = std::env::var("SANTACALL_REDIS_URL").ok();
        let admin_token = std::env::var("SANTACALL_ADMIN_TOKEN").ok();
        let ledger = setup_ledger(&config, redis_url)?;
        let geoblock = GeoblockPolicy::from_config(&config.geoblock);
        Ok(Self::new_with_ledger(config, ledger, geoblock, admin_token))
    }

    pub fn new_with_ledger(
        config: Arc<Config>,
        ledger: UsageLedger,
        geoblock: GeoblockPolicy,
        admin_token: Option<String>,
    ) -> Self {
        let admin_token = admin_token
            .filter(|token| !token.is_empty())
            .map(|token| Arc::new(SecretString::from(token)));
        Self {
            config,
            ledger: Arc::new(ledger),
            geoblock: Arc::new(geoblock),
            admin_token,
        }
    }
}

/// Build the usage ledger. Redis is used when `redis_url` is set and non-empty; the connection is
/// opened on first use.
pub fn setup_ledger(config: &Config, redis_url: Option<String>) -> Result<UsageLedger, Error> {
    let ledger_config = config.quota.ledger_config();
    let durable = match redis_url {
        Some(url) if !url.is_empty() => {
            let settings = config.storage.redis_settings(ledger_config.retention_days);
            tracing::info!(
                "Durable usage storage configured (Redis, key prefix `{}`)",
                settings.key_prefix
            );
            DurableBackend::new(Box::new(RedisConnector::new(
                SecretString::from(url),
                settings,
            )))
        }
        Some(_) => {
            tracing::warn!("`SANTACALL_REDIS_URL` is empty, usage will only be kept in memory");
            DurableBackend::disabled()
        }
        None => {
            tracing::info!("`SANTACALL_REDIS_URL` is not set, usage will only be kept in memory");
            DurableBackend::disabled()
        }
    };
    if !ledger_config.max_daily_seconds.is_finite() || ledger_config.max_daily_seconds <= 0.0 {
        return Err(Error::new(ErrorDetails::AppState {
            message: format!(
                "Daily cap must be positive (got {})",
                ledger_config.max_daily_seconds
            ),
        }));
    }
    Ok(UsageLedger::new(
        ledger_config,
        Arc::new(MemoryUsageStore::new()),
        durable,
        Arc::new(SystemClock),
    ))
}

/// The `/api` routes plus health checks and the JSON 404 fallback.
///
/// `/api` responses get CORS headers and `Cache-Control: no-store`.
pub fn build_api_router(app_state: AppStateData) -> Result<Router, Error> {
    let mut api_routes = Router::new()
        .route(
            "/api/check-usage",
            get(endpoints::usage::check_usage_handler),
        )
        .route(
            "/api/record-usage",
            post(endpoints::usage::record_usage_handler),
        )
        .route(
            "/api/reserve-time",
            post(endpoints::usage::reserve_time_handler),
        )
        .route(
            "/api/check-geoblock",
            get(endpoints::geoblock::check_geoblock_handler),
        );

    if app_state.config.admin.enabled {
        if app_state.admin_token.is_none() {
            tracing::warn!("Admin routes are enabled without `SANTACALL_ADMIN_TOKEN`, so anyone can reset usage");
        }
        let admin_routes = Router::new()
            .route(
                "/api/test-bypass",
                get(endpoints::admin::test_bypass_handler)
                    .post(endpoints::admin::test_bypass_handler),
            )
            .layer(axum::middleware::from_fn_with_state(
                app_state.admin_token.clone(),
                endpoints::admin::require_admin_token,
            ));
        api_routes = api_routes.merge(admin_routes);
    }

    let api_routes = api_routes
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(cors_layer(app_state.config.gateway.frontend_url.as_deref())?);

    Ok(Router::new()
        .merge(api_routes)
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .fallback(endpoints::fallback::handle_404)
        .with_state(app_state))
}

/// Credentialed CORS for the site's frontend. Without a configured origin the caller's origin is
/// mirrored back, since `*` is not allowed together with credentials.
pub fn cors_layer(frontend_url: Option<&str>) -> Result<CorsLayer, Error> {
    let allow_origin = match frontend_url {
        Some(url) => {
            let origin = HeaderValue::from_str(url.trim_end_matches('/')).map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("`gateway.frontend_url` is not a valid origin: {e}"),
                })
            })?;
            AllowOrigin::exact(origin)
        }
        None => AllowOrigin::mirror_request(),
    };
    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .expose_headers([
            SET_COOKIE,
            HeaderName::from_static(COOKIE_SET_HEADER),
            HeaderName::from_static(USER_ID_HEADER),
        ]))
}

/// JSON body extractor that reports the path of the offending field on failure
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = bytes::Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?
            .0;

        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}
