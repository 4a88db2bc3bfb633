//! `#[tokio_timeout_test]`: run an async test on a multi-threaded tokio
//! runtime and fail it, rather than hang the suite, once a deadline passes.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]          // 30 s
//! async fn negotiates() { /* ... */ }
//!
//! #[test_timeout::tokio_timeout_test(5)]       // 5 s
//! async fn keepalive_fires() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const WORKER_THREADS: usize = 2;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let test_name = sig.ident.to_string();
    let workers = WORKER_THREADS;

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#timeout_secs);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(#workers)
                .enable_all()
                .build()
                .expect("failed to build tokio runtime");
            let outcome = runtime.block_on(async move {
                tokio::time::timeout(deadline, async move #block).await
            });
            runtime.shutdown_timeout(std::time::Duration::from_secs(1));
            if outcome.is_err() {
                panic!("{} timed out after {:?}", #test_name, deadline);
            }
        }
    })
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new(
            Span::call_site(),
            "timeout must be at least one second",
        ));
    }
    Ok(secs)
}

/// `#[test]` and `#[tokio::test]` would register the function twice.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
