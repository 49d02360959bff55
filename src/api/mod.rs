//! Repository-provider integration module: the `RepositoryProvider` trait
//! and its HTTP-backed implementation, covering token minting, profile
//! detection, and commit-status reporting (§6).

mod client;
mod errors;
mod types;

pub use client::{HttpRepositoryProvider, RepositoryProvider};
pub use errors::{ApiError, ApiResult};
pub use types::CommitState;
