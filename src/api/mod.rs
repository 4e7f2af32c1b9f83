//! HTTP surface: operational endpoints, proxy fallback and the real-time socket

pub mod handlers;
pub mod routes;
pub mod ws;
