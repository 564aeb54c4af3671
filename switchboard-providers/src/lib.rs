//! # Switchboard provider layer
//!
//! Everything the gateway needs to talk to upstream LLM vendors and decide
//! which one should serve a request:
//!
//! - [`providers`]: the [`providers::ProviderAdapter`] trait and one adapter
//!   per vendor (OpenAI, Anthropic, Groq, Together, Ollama)
//! - [`registry`]: adapter table plus the periodic health probe loop
//! - [`capability`]: model profiles (quality, cost, latency EMA, tags)
//! - [`classifier`]: pure prompt analysis
//! - [`router`]: strategy-weighted candidate scoring
//! - [`circuit_breaker`]: per-provider admission control
//! - [`fallback`]: ordered failover execution with per-provider deadlines
//!
//! The HTTP surface, caching, budgets, and metrics live in the
//! `switchboard-gateway` crate.

pub mod capability;
pub mod circuit_breaker;
pub mod classifier;
pub mod common;
pub mod error;
pub mod fallback;
pub mod models;
pub mod providers;
pub mod registry;
pub mod router;

pub use capability::{Capability, CapabilityMap, ModelProfile};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState};
pub use classifier::{classify, Classification, Complexity};
pub use error::{Attempt, ChainError, ProviderError, RouteError};
pub use fallback::{ChainOutcome, FallbackChain};
pub use models::{
    ChatRequest, ChatResponse, ChatResult, GatewayMetadata, Message, Role, StreamDelta, Usage,
};
pub use providers::{create_adapter, AdapterConfig, ChatStream, ProviderAdapter};
pub use registry::{ProviderRegistry, ProviderStatus};
pub use router::{ModelRouter, RoutingConfig, RoutingDecision, RoutingStrategy};
