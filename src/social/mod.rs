//! Social data-access layer: typed query keys, the invalidation table,
//! the backend contract and its HTTP and in-memory implementations.

pub mod api_types;
pub mod backend;
pub mod cached_client;
pub mod client;
pub mod invalidation;
pub mod keys;
pub mod memory;
pub mod profile;
pub mod types;

pub use backend::Backend;
pub use cached_client::SocialClient;
pub use client::HttpBackend;
pub use invalidation::WriteOp;
pub use keys::{QueryTag, SocialQueryKey};
pub use memory::MemoryBackend;
pub use profile::{FollowAction, ProfileSummary};
