use darling::FromMeta;
use heck::ToUpperCamelCase as _;
use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{spanned::Spanned as _, Error, FnArg, Ident, ItemFn, Pat, PatType, ReturnType, Type, Visibility};

/// Options for the `#[compute_method]` attribute.
#[derive(Debug, Default, FromMeta)]
pub struct ComputeMethodAttr {
    /// Method name. Default: the function name.
    #[darling(default)]
    name: Option<String>,

    /// Override the generated struct name. Default: PascalCase of function name.
    #[darling(default)]
    struct_name: Option<String>,

    #[darling(default)]
    no_cache: bool,

    #[darling(default)]
    min_cache_ms: Option<u64>,

    #[darling(default)]
    auto_invalidate_ms: Option<u64>,

    #[darling(default)]
    polymorphic: bool,

    /// Derive `Serialize` and `Deserialize` for the generated struct.
    #[darling(default)]
    remote: bool,
}

struct Param {
    name: Ident,
    ty: Type,
}

struct ParsedFn {
    vis: Visibility,
    name: Ident,
    params: Vec<Param>,
    output_ty: Type,
}

pub fn generate_compute_method(attr: ComputeMethodAttr, input_fn: ItemFn) -> Result<TokenStream, Error> {
    let parsed = parse_function(&input_fn)?;

    let struct_name = match &attr.struct_name {
        Some(name) => format_ident!("{}", name),
        None => format_ident!("{}", parsed.name.to_string().to_upper_camel_case()),
    };

    let struct_def = generate_struct(&parsed, &struct_name, attr.remote);
    let method_impl = generate_method_impl(&parsed, &struct_name, &attr);

    Ok(quote! {
        #input_fn
        #struct_def
        #method_impl
    })
}

fn parse_function(input_fn: &ItemFn) -> Result<ParsedFn, Error> {
    if input_fn.sig.asyncness.is_none() {
        return Err(Error::new(
            input_fn.sig.fn_token.span(),
            "compute methods must be `async fn`",
        ));
    }
    if !input_fn.sig.generics.params.is_empty() {
        return Err(Error::new(
            input_fn.sig.generics.span(),
            "compute methods cannot be generic",
        ));
    }

    let mut iter = input_fn.sig.inputs.iter();
    let first_param = iter.next().ok_or_else(|| {
        Error::new(
            input_fn.sig.span(),
            "compute method must have `ctx: &ComputeContext` as first parameter",
        )
    })?;
    validate_ctx_param(first_param)?;

    let mut params = Vec::new();
    for arg in iter {
        match arg {
            FnArg::Typed(pat_type) => params.push(parse_param(pat_type)?),
            FnArg::Receiver(_) => {
                return Err(Error::new(arg.span(), "compute methods cannot have `self`"));
            }
        }
    }

    let output_ty = parse_return_type(&input_fn.sig.output)?;

    Ok(ParsedFn {
        vis: input_fn.vis.clone(),
        name: input_fn.sig.ident.clone(),
        params,
        output_ty,
    })
}

fn validate_ctx_param(arg: &FnArg) -> Result<(), Error> {
    match arg {
        FnArg::Typed(pat_type) => {
            if let Pat::Ident(pat_ident) = &*pat_type.pat {
                let name = pat_ident.ident.to_string();
                if name != "ctx" && name != "_ctx" {
                    return Err(Error::new(
                        pat_ident.ident.span(),
                        "first parameter must be named `ctx`",
                    ));
                }
            }
            if !matches!(&*pat_type.ty, Type::Reference(_)) {
                return Err(Error::new(
                    pat_type.ty.span(),
                    "first parameter must be `&ComputeContext`",
                ));
            }
            Ok(())
        }
        FnArg::Receiver(_) => Err(Error::new(
            arg.span(),
            "first parameter must be `ctx: &ComputeContext`, not `self`",
        )),
    }
}

fn parse_param(pat_type: &PatType) -> Result<Param, Error> {
    let name = match &*pat_type.pat {
        Pat::Ident(pat_ident) => pat_ident.ident.clone(),
        _ => {
            return Err(Error::new(
                pat_type.pat.span(),
                "expected simple identifier pattern",
            ))
        }
    };

    Ok(Param {
        name,
        ty: (*pat_type.ty).clone(),
    })
}

fn parse_return_type(ret: &ReturnType) -> Result<Type, Error> {
    match ret {
        ReturnType::Default => Err(Error::new(
            ret.span(),
            "compute method must return `Result<T, ComputeError>`",
        )),
        ReturnType::Type(_, ty) => extract_result_ok_type(ty),
    }
}

fn extract_result_ok_type(ty: &Type) -> Result<Type, Error> {
    if let Type::Path(type_path) = ty {
        if let Some(segment) = type_path.path.segments.last() {
            if segment.ident == "Result" {
                if let syn::PathArguments::AngleBracketed(args) = &segment.arguments {
                    if let Some(syn::GenericArgument::Type(ok_ty)) = args.args.first() {
                        return Ok(ok_ty.clone());
                    }
                }
            }
        }
    }
    Err(Error::new(
        ty.span(),
        "expected `Result<T, ComputeError>` return type",
    ))
}

fn generate_struct(parsed: &ParsedFn, struct_name: &Ident, remote: bool) -> TokenStream {
    let vis = &parsed.vis;
    let fields: Vec<_> = parsed
        .params
        .iter()
        .map(|p| {
            let name = &p.name;
            let ty = &p.ty;
            quote! { pub #name: #ty }
        })
        .collect();

    let field_names: Vec<_> = parsed.params.iter().map(|p| &p.name).collect();
    let field_types: Vec<_> = parsed.params.iter().map(|p| &p.ty).collect();

    let serde_derive = remote.then(|| {
        quote! {
            #[derive(::computed_flow::__private::serde::Serialize, ::computed_flow::__private::serde::Deserialize)]
            #[serde(crate = "::computed_flow::__private::serde")]
        }
    });

    let new_impl = if parsed.params.is_empty() {
        quote! {
            impl #struct_name {
                /// Create a new call.
                #vis fn new() -> Self {
                    Self {}
                }
            }

            impl ::std::default::Default for #struct_name {
                fn default() -> Self {
                    Self::new()
                }
            }
        }
    } else {
        quote! {
            impl #struct_name {
                /// Create a new call.
                #vis fn new(#( #field_names: #field_types ),*) -> Self {
                    Self { #( #field_names ),* }
                }
            }
        }
    };

    quote! {
        #[derive(Clone, Debug, Hash, PartialEq, Eq)]
        #serde_derive
        #vis struct #struct_name {
            #( #fields ),*
        }

        #new_impl
    }
}

fn generate_method_impl(parsed: &ParsedFn, struct_name: &Ident, attr: &ComputeMethodAttr) -> TokenStream {
    let output_ty = &parsed.output_ty;
    let fn_name = &parsed.name;
    let field_names: Vec<_> = parsed.params.iter().map(|p| &p.name).collect();

    let method_name = attr
        .name
        .clone()
        .unwrap_or_else(|| parsed.name.to_string());

    let no_cache = attr.no_cache.then(|| quote! { .no_cache() });
    let min_cache = attr.min_cache_ms.map(|ms| quote! { .min_cache_ms(#ms) });
    let auto_invalidate = attr
        .auto_invalidate_ms
        .map(|ms| quote! { .auto_invalidate_ms(#ms) });
    let polymorphic = attr.polymorphic.then(|| quote! { .polymorphic() });

    quote! {
        #[::computed_flow::__private::async_trait]
        impl ::computed_flow::ComputeMethod for #struct_name {
            type Output = #output_ty;

            const DEFINITION: ::computed_flow::MethodDef =
                ::computed_flow::MethodDef::new(#method_name) #no_cache #min_cache #auto_invalidate #polymorphic;

            async fn compute(&self, ctx: &::computed_flow::ComputeContext) -> ::std::result::Result<Self::Output, ::computed_flow::ComputeError> {
                #fn_name(ctx #(, self.#field_names.clone() )*).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use darling::ast::NestedMeta;
    use quote::quote;
    use syn::ItemFn;

    fn normalize_tokens(tokens: TokenStream) -> String {
        tokens
            .to_string()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn parse_attr(tokens: TokenStream) -> ComputeMethodAttr {
        let items = NestedMeta::parse_meta_list(tokens).unwrap();
        ComputeMethodAttr::from_list(&items).unwrap()
    }

    #[test]
    fn test_compute_method_defaults() {
        let input_fn: ItemFn = syn::parse_quote! {
            #[inline]
            pub async fn square(ctx: &ComputeContext, x: i64) -> Result<i64, ComputeError> {
                Ok(x * x)
            }
        };

        let output = generate_compute_method(ComputeMethodAttr::default(), input_fn).unwrap();

        let expected = quote! {
            #[inline]
            pub async fn square(ctx: &ComputeContext, x: i64) -> Result<i64, ComputeError> {
                Ok(x * x)
            }

            #[derive(Clone, Debug, Hash, PartialEq, Eq)]
            pub struct Square {
                pub x: i64
            }

            impl Square {
                #[doc = r" Create a new call."]
                pub fn new(x: i64) -> Self {
                    Self { x }
                }
            }

            #[::computed_flow::__private::async_trait]
            impl ::computed_flow::ComputeMethod for Square {
                type Output = i64;

                const DEFINITION: ::computed_flow::MethodDef =
                    ::computed_flow::MethodDef::new("square");

                async fn compute(&self, ctx: &::computed_flow::ComputeContext) -> ::std::result::Result<Self::Output, ::computed_flow::ComputeError> {
                    square(ctx, self.x.clone()).await
                }
            }
        };

        assert_eq!(normalize_tokens(output), normalize_tokens(expected));
    }

    #[test]
    fn test_compute_method_options() {
        let attr = parse_attr(quote! {
            name = "rates.get", struct_name = "GetRate", min_cache_ms = 500, auto_invalidate_ms = 60000, polymorphic
        });
        let input_fn: ItemFn = syn::parse_quote! {
            async fn rate(ctx: &ComputeContext, from: String, to: String) -> Result<f64, ComputeError> {
                Ok(1.0)
            }
        };

        let output = generate_compute_method(attr, input_fn).unwrap();

        let expected = quote! {
            async fn rate(ctx: &ComputeContext, from: String, to: String) -> Result<f64, ComputeError> {
                Ok(1.0)
            }

            #[derive(Clone, Debug, Hash, PartialEq, Eq)]
            struct GetRate {
                pub from: String,
                pub to: String
            }

            impl GetRate {
                #[doc = r" Create a new call."]
                fn new(from: String, to: String) -> Self {
                    Self { from, to }
                }
            }

            #[::computed_flow::__private::async_trait]
            impl ::computed_flow::ComputeMethod for GetRate {
                type Output = f64;

                const DEFINITION: ::computed_flow::MethodDef =
                    ::computed_flow::MethodDef::new("rates.get") .min_cache_ms(500u64) .auto_invalidate_ms(60000u64) .polymorphic();

                async fn compute(&self, ctx: &::computed_flow::ComputeContext) -> ::std::result::Result<Self::Output, ::computed_flow::ComputeError> {
                    rate(ctx, self.from.clone(), self.to.clone()).await
                }
            }
        };

        assert_eq!(normalize_tokens(output), normalize_tokens(expected));
    }

    #[test]
    fn test_compute_method_remote_no_params() {
        let attr = parse_attr(quote! { remote, no_cache });
        let input_fn: ItemFn = syn::parse_quote! {
            async fn now(_ctx: &ComputeContext) -> Result<u64, ComputeError> {
                Ok(0)
            }
        };

        let output = generate_compute_method(attr, input_fn).unwrap();

        let expected = quote! {
            async fn now(_ctx: &ComputeContext) -> Result<u64, ComputeError> {
                Ok(0)
            }

            #[derive(Clone, Debug, Hash, PartialEq, Eq)]
            #[derive(::computed_flow::__private::serde::Serialize, ::computed_flow::__private::serde::Deserialize)]
            #[serde(crate = "::computed_flow::__private::serde")]
            struct Now {
            }

            impl Now {
                #[doc = r" Create a new call."]
                fn new() -> Self {
                    Self {}
                }
            }

            impl ::std::default::Default for Now {
                fn default() -> Self {
                    Self::new()
                }
            }

            #[::computed_flow::__private::async_trait]
            impl ::computed_flow::ComputeMethod for Now {
                type Output = u64;

                const DEFINITION: ::computed_flow::MethodDef =
                    ::computed_flow::MethodDef::new("now") .no_cache();

                async fn compute(&self, ctx: &::computed_flow::ComputeContext) -> ::std::result::Result<Self::Output, ::computed_flow::ComputeError> {
                    now(ctx).await
                }
            }
        };

        assert_eq!(normalize_tokens(output), normalize_tokens(expected));
    }

    #[test]
    fn test_rejects_sync_fn() {
        let input_fn: ItemFn = syn::parse_quote! {
            fn square(ctx: &ComputeContext, x: i64) -> Result<i64, ComputeError> {
                Ok(x * x)
            }
        };
        let err = generate_compute_method(ComputeMethodAttr::default(), input_fn)
            .err()
            .unwrap();
        assert!(err.to_string().contains("async fn"));
    }

    #[test]
    fn test_rejects_missing_ctx() {
        let input_fn: ItemFn = syn::parse_quote! {
            async fn square(x: i64) -> Result<i64, ComputeError> {
                Ok(x * x)
            }
        };
        let err = generate_compute_method(ComputeMethodAttr::default(), input_fn)
            .err()
            .unwrap();
        assert!(err.to_string().contains("ctx"));
    }
}
