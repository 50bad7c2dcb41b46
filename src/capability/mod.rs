//! Capability model: tokens, contexts, the process-wide manager, policy
//! loading, and the declared ⊆ granted validator.

pub mod context;
pub mod manager;
pub mod pattern;
pub mod policy;
pub mod token;
pub mod validator;

pub use self::context::CapabilityContext;
pub use self::manager::{CapabilityManager, ContextGuard};
pub use self::pattern::ResourcePattern;
pub use self::policy::{CapabilityGrant, PolicyDocument, PolicyStore, SharedPolicies};
pub use self::token::{CapabilityToken, Constraints};
