pub mod admin;
pub mod fallback;
pub mod geoblock;
pub mod status;
pub mod usage;
