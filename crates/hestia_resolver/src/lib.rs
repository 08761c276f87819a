//! Hestia resolution engine.
//!
//! Resolves free-text device-control requests into verified entity sets:
//! blocking → (shortcut cache) → multi-signal scoring → ground-truth
//! verification → ambiguity decision, with a persisted clarification dialog
//! for the ambiguous case and a safety rule chain gating every plan.

pub mod ambiguity;
pub mod collaborators;
pub mod config;
pub mod index;
pub mod pipeline;
pub mod safety;
pub mod scoring;
pub mod session;
pub mod shortcut;
pub mod vector;
pub mod verify;

pub use collaborators::{DeviceRegistry, Embedder, RegistryResponse, TermExtractor};
pub use config::ResolverConfig;
pub use pipeline::Resolver;
