//! LLM integration for swarm workers.
//!
//! Workers never talk to a provider directly. They go through a
//! [`GenerationService`], normally a [`ProviderGenerationService`] wrapping
//! a [`LiteLlmClient`]:
//!
//! ```ignore
//! use std::sync::Arc;
//! use swarm_dispatch::llm::{GenerationService, LiteLlmClient, ProviderGenerationService};
//!
//! let client = LiteLlmClient::from_env()?;
//! let service = ProviderGenerationService::new(Arc::new(client));
//! let output = service.generate("You are a Rust engineer.", "Write add()", 1024, 0.1).await?;
//! println!("{} (${:.4})", output.text, output.cost);
//! ```

pub mod client;
pub mod generation;
pub mod pricing;

pub use client::{default_llm_retry, ChatProvider, ChatReply, ChatRequest, LiteLlmClient};
pub use generation::{GenerationOutput, GenerationService, ProviderGenerationService};
pub use pricing::{ModelPrice, ModelPricing};
