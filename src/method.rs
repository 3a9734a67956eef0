//! Compute method definition.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ComputeError, RpcError};
use crate::key::{CacheKey, InputKey, MethodId, ReceiverId, WireKey};
use crate::runtime::ComputeContext;

/// Static caching options of a compute method.
///
/// Built with const functions so it can live in an associated constant:
///
/// ```
/// use computed_flow::MethodDef;
///
/// const PRICE: MethodDef = MethodDef::new("price")
///     .min_cache_ms(500)
///     .auto_invalidate_ms(60_000);
/// assert!(PRICE.cache_enabled);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDef {
    /// Method name. Remote calls are routed by this name.
    pub id: MethodId,
    /// When `false`, every call runs the body and nothing is registered.
    pub cache_enabled: bool,
    /// The registry keeps computed nodes alive for at least this long.
    pub min_cache_duration: Option<Duration>,
    /// Nodes invalidate themselves this long after they become consistent.
    pub auto_invalidation_delay: Option<Duration>,
    /// Accept remote results whose type tag differs from the local output type.
    pub polymorphic_result: bool,
}

impl MethodDef {
    /// A cached method with default options.
    pub const fn new(name: &'static str) -> Self {
        Self {
            id: MethodId(name),
            cache_enabled: true,
            min_cache_duration: None,
            auto_invalidation_delay: None,
            polymorphic_result: false,
        }
    }

    /// Disable caching.
    pub const fn no_cache(mut self) -> Self {
        self.cache_enabled = false;
        self
    }

    /// Set the minimum cache duration in milliseconds.
    pub const fn min_cache_ms(mut self, ms: u64) -> Self {
        self.min_cache_duration = Some(Duration::from_millis(ms));
        self
    }

    /// Set the auto-invalidation delay in milliseconds.
    pub const fn auto_invalidate_ms(mut self, ms: u64) -> Self {
        self.auto_invalidation_delay = Some(Duration::from_millis(ms));
        self
    }

    /// Accept remote results of any type tag.
    pub const fn polymorphic(mut self) -> Self {
        self.polymorphic_result = true;
        self
    }
}

/// A side-effect-free method whose results are cached as computed nodes.
///
/// The implementing value is itself the argument tuple: it is hashed and
/// compared to build the [`InputKey`]. Use `#[compute_method]` to generate
/// the implementation from an `async fn`.
///
/// # Example
///
/// ```
/// use computed_flow::{async_trait, ComputeContext, ComputeError, ComputeMethod, MethodDef};
///
/// #[derive(Clone, Debug, Hash, PartialEq, Eq)]
/// struct Square(i64);
///
/// #[async_trait]
/// impl ComputeMethod for Square {
///     type Output = i64;
///     const DEFINITION: MethodDef = MethodDef::new("square");
///
///     async fn compute(&self, _ctx: &ComputeContext) -> Result<i64, ComputeError> {
///         Ok(self.0 * self.0)
///     }
/// }
/// ```
#[async_trait]
pub trait ComputeMethod: CacheKey + Clone + Send + Sync + 'static {
    /// The value produced by the method.
    type Output: Clone + Send + Sync + 'static;

    /// Caching options.
    const DEFINITION: MethodDef;

    /// The service instance this call is made on.
    fn receiver(&self) -> ReceiverId {
        ReceiverId::NONE
    }

    /// Run the body. Nested calls made through `ctx` become dependencies.
    ///
    /// Application errors converted with `?` are captured into the node as a
    /// [`Failure`](crate::Failure). Return [`ComputeError::Cancelled`] to abort
    /// without caching anything.
    async fn compute(&self, ctx: &ComputeContext) -> Result<Self::Output, ComputeError>;

    /// The registry key of this call.
    fn input_key(&self) -> InputKey {
        InputKey::new(Self::DEFINITION.id, self.receiver(), self.clone())
    }
}

/// A compute method that can be invoked on a remote peer.
///
/// Implemented for every [`ComputeMethod`] whose arguments and output are serde types.
pub trait RemoteMethod: ComputeMethod + Serialize + DeserializeOwned {
    /// Type tag sent along with results, checked unless the method is polymorphic.
    fn type_tag() -> &'static str {
        std::any::type_name::<Self::Output>()
    }

    /// Stable cross-process key of this call.
    fn wire_key(&self) -> Result<WireKey, RpcError> {
        Ok(WireKey::encode(Self::DEFINITION.id, self.receiver(), self)?)
    }

    /// Encode an output for the wire.
    fn encode_output(output: &Self::Output) -> Result<Vec<u8>, RpcError>;

    /// Decode an output from the wire.
    fn decode_output(bytes: &[u8]) -> Result<Self::Output, RpcError>;
}

impl<M> RemoteMethod for M
where
    M: ComputeMethod + Serialize + DeserializeOwned,
    M::Output: Serialize + DeserializeOwned,
{
    fn encode_output(output: &M::Output) -> Result<Vec<u8>, RpcError> {
        Ok(bincode::serialize(output)?)
    }

    fn decode_output(bytes: &[u8]) -> Result<M::Output, RpcError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
