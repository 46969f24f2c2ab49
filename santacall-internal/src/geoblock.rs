use std::collections::HashSet;

use axum::http::HeaderMap;
use tracing::{debug, info};

use crate::config_parser::GeoblockConfig;

/// Country code headers set by the edge, in order of preference
const COUNTRY_HEADERS: [&str; 2] = ["x-vercel-ip-country", "x-vercel-ip-country-code"];

/// Outcome of a geoblock check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoDecision {
    Allowed,
    Blocked { country: String, test_mode: bool },
}

/// Country-based access policy.
///
/// A `testCountry` supplied by the caller is checked against the test list instead of the real one,
/// so the blocked page can be exercised from anywhere.
#[derive(Debug, Clone, Default)]
pub struct GeoblockPolicy {
    blocked: HashSet<String>,
    test_blocked: HashSet<String>,
}

impl GeoblockPolicy {
    /// Build from config. `BLOCKED_COUNTRIES` and `TEST_BLOCKED_COUNTRIES` override the configured
    /// lists when set.
    pub fn from_config(config: &GeoblockConfig) -> Self {
        Self::with_overrides(
            config,
            std::env::var("BLOCKED_COUNTRIES").ok(),
            std::env::var("TEST_BLOCKED_COUNTRIES").ok(),
        )
    }

    pub fn with_overrides(
        config: &GeoblockConfig,
        blocked_override: Option<String>,
        test_blocked_override: Option<String>,
    ) -> Self {
        let blocked = match blocked_override {
            Some(list) => parse_country_list(&list),
            None => normalize(&config.blocked_countries),
        };
        let test_blocked = match test_blocked_override {
            Some(list) => parse_country_list(&list),
            None => normalize(&config.test_blocked_countries),
        };
        if !blocked.is_empty() {
            info!("Geoblocking {} country code(s)", blocked.len());
        }
        Self {
            blocked,
            test_blocked,
        }
    }

    pub fn check(&self, test_country: Option<&str>, headers: &HeaderMap) -> GeoDecision {
        let test_country = test_country.map(str::trim).filter(|c| !c.is_empty());
        let (country, list, test_mode) = match test_country {
            Some(country) => (Some(country.to_string()), &self.test_blocked, true),
            None => (country_from_headers(headers), &self.blocked, false),
        };

        let Some(country) = country else {
            debug!("No country code on request, allowing");
            return GeoDecision::Allowed;
        };
        let country = country.to_ascii_uppercase();
        if list.contains(&country) {
            GeoDecision::Blocked { country, test_mode }
        } else {
            GeoDecision::Allowed
        }
    }
}

fn country_from_headers(headers: &HeaderMap) -> Option<String> {
    COUNTRY_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

fn parse_country_list(list: &str) -> HashSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_ascii_uppercase)
        .collect()
}

fn normalize(countries: &[String]) -> HashSet<String> {
    countries
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(str::to_ascii_uppercase)
        .collect()
}
