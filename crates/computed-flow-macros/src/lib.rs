//! Procedural macros for computed-flow.
//!
//! # Example
//!
//! ```ignore
//! use computed_flow::{compute_method, ComputeContext, ComputeError};
//!
//! #[compute_method(min_cache_ms = 500)]
//! pub async fn square(ctx: &ComputeContext, x: i64) -> Result<i64, ComputeError> {
//!     Ok(x * x)
//! }
//!
//! // Generates:
//! // pub struct Square { pub x: i64 }
//! // impl ComputeMethod for Square { ... }
//! ```

mod compute_method;

use darling::{ast::NestedMeta, FromMeta as _};
use proc_macro::TokenStream;
use syn::{parse_macro_input, ItemFn};

use crate::compute_method::{generate_compute_method, ComputeMethodAttr};

/// Define a compute method from an `async fn`.
///
/// The first parameter must be `ctx: &ComputeContext`. The remaining parameters
/// become the fields of the generated struct and form the cache key, so they
/// must implement `Clone`, `Debug`, `Hash` and `Eq`.
///
/// # Attributes
///
/// - `name = "name"`: Method name used for routing remote calls (default: function name)
/// - `struct_name = "Name"`: Override generated struct name (default: PascalCase of function name)
/// - `no_cache`: Run the body on every call
/// - `min_cache_ms = N`: Keep results registered for at least N milliseconds
/// - `auto_invalidate_ms = N`: Invalidate results N milliseconds after they are computed
/// - `polymorphic`: Accept remote results of any type tag
/// - `remote`: Derive serde traits so the method can be served and called over RPC
///
/// # Example
///
/// ```ignore
/// use computed_flow::{compute_method, ComputeContext, ComputeError};
///
/// #[compute_method(remote, auto_invalidate_ms = 60_000)]
/// pub async fn exchange_rate(ctx: &ComputeContext, from: String, to: String) -> Result<f64, ComputeError> {
///     fetch_rate(&from, &to).await
/// }
/// ```
#[proc_macro_attribute]
pub fn compute_method(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attr_args = match NestedMeta::parse_meta_list(attr.into()) {
        Ok(v) => v,
        Err(e) => return TokenStream::from(e.to_compile_error()),
    };

    let attr = match ComputeMethodAttr::from_list(&attr_args) {
        Ok(v) => v,
        Err(e) => return TokenStream::from(e.write_errors()),
    };

    let input_fn = parse_macro_input!(item as ItemFn);

    match generate_compute_method(attr, input_fn) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}
