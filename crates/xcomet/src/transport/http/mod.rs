//! HTTP front: axum routes over [`EvaluationService`](crate::service::EvaluationService).

mod routes;
mod server;

pub use routes::{ApiError, HealthCheckResponse, routes};
pub use server::{ServerConfig, serve};
