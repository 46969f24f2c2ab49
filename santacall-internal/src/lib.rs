pub mod config_parser; // santacall.toml config file
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod geoblock; // country-based access policy
pub mod identity; // cookie identifier and client IP resolution
pub mod observability; // utilities for observability (logs, metrics, etc.)
pub mod usage; // daily usage ledger
