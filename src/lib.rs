//! PDF/A Conversion Service Library
//!
//! This library provides the core of an HTTP front-end for an external
//! PDF/A conversion tool. Requests share a bounded pool of converter
//! instances, and every staged input is tied to its generated output by a
//! correlation key so both can be deleted exactly once.
//!
//! ## Module Overview
//!
//! - `pool`: bounded pool of converter handles (borrow, return, validate, warm-up)
//! - `converter`: converter trait and the command-line tool implementation
//! - `staging`: uploaded-file staging and correlation keys
//! - `naming`: the file naming convention shared with the conversion tool
//! - `invoker`: runs one conversion on a pooled converter
//! - `cleanup`: request-scoped deletion of staged inputs and outputs
//! - `error`: failure taxonomy and XML/JSON error payloads
//! - `request`: per-request conversion record
//! - `routes`: axum router (`/convert`, `/version`, `/health`)
//! - `config`: environment configuration
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use pdfa_service::{
//!     config::ServiceConfig,
//!     converter::CommandConverterFactory,
//!     pool::ConverterPool,
//!     routes::{router, AppState},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServiceConfig::from_env()?;
//!
//!     let factory = Arc::new(CommandConverterFactory::new(config.tool_command()));
//!     let pool = ConverterPool::new(factory, config.pool_config());
//!     pool.warm_up().await;
//!
//!     let app = router(AppState::new(&config, pool)?);
//!     let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod cleanup;
pub mod config;
pub mod converter;
pub mod error;
pub mod invoker;
pub mod naming;
pub mod pool;
pub mod request;
pub mod routes;
pub mod staging;
pub mod telemetry;
