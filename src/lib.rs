#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

extern crate self as computed_flow;

mod error;
mod invalidation;
mod key;
mod method;
mod node;
mod registry;
mod runtime;
mod tracer;

pub mod persist;
pub mod rpc;

pub use async_trait::async_trait;
pub use error::*;
pub use invalidation::*;
pub use key::*;
pub use method::*;
pub use node::*;
pub use registry::ComputedRegistry;
pub use runtime::*;
pub use tracer::*;

#[cfg(feature = "macros")]
pub use computed_flow_macros::compute_method;

#[doc(hidden)]
pub mod __private {
    pub use async_trait::async_trait;
    pub use serde;
}
