//! Business logic services

pub mod concurrency;
pub mod geo;
pub mod geocoding;
pub mod local_ordering;
pub mod nominatim;
pub mod optimizer;
pub mod planner;
pub mod route_builder;
pub mod route_store;
pub mod routing;
