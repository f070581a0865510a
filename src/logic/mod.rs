use std::future::Future;
use std::pin::Pin;

pub mod adaptor;
pub mod attribute_cache;
pub mod hydrate;
pub mod identical;
pub mod instance_cache;
pub mod write;

pub use adaptor::{AdaptorSettings, GraphAdaptor, StableIdentifierRecord};
pub use attribute_cache::{AttributeCache, AttributeTable, CachedValue};
pub use identical::Identicals;
pub use instance_cache::InstanceCache;
pub use write::{RetryPolicy, Transaction};

/// Boxed future for the recursive walks (hydration, recursive store,
/// identical lookup).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
