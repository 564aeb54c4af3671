//! # Switchboard gateway
//!
//! An OpenAI-compatible HTTP gateway in front of multiple LLM providers.
//! Clients point their base URL here and gain capability-aware routing,
//! automatic failover with circuit breakers, semantic response caching,
//! per-key budgets and rate limits, and uniform metrics, without changing
//! a single request payload.
//!
//! ## Module map
//!
//! - [`config`]: TOML + environment configuration
//! - [`server`]: state assembly, routes, background tasks, shutdown
//! - [`handlers`]: the request pipeline and the status APIs
//! - [`middleware`]: request metadata headers and admin auth
//! - [`semantic_cache`]: embedding service and the response cache
//! - [`auth`]: API keys, budgets, rate limits
//! - [`metrics`]: counters, Prometheus rendering, request tracker
//! - [`request_log`]: buffered request logging with a batch flusher
//! - [`gateway_error`]: the HTTP error taxonomy
//!
//! Provider adapters and the routing/reliability machinery live in the
//! `switchboard-providers` crate.

pub mod auth;
pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod request_log;
pub mod semantic_cache;
pub mod server;

pub use config::Config;
pub use gateway_error::GatewayError;
pub use server::{build_router, build_state, create_server, AppState};
