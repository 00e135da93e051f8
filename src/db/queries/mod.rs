//! Database queries

pub mod route_optimization;
