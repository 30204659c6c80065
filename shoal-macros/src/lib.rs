use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Test attribute that installs the crate's tracing subscriber before the body runs.
///
/// Async functions run on a tokio runtime; extra arguments are forwarded to
/// `#[tokio::test]`, e.g. `#[shoal::test(flavor = "multi_thread")]`.
///
/// ```ignore
/// #[shoal::test]
/// async fn leases_item() { ... }
///
/// #[shoal::test]
/// fn scores_item() { ... }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args_ts = proc_macro2::TokenStream::from(attr);
    let input = parse_macro_input!(item as ItemFn);
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let name = &input.sig.ident;

    let paren_args = if args_ts.is_empty() {
        quote! {}
    } else {
        quote! { ( #args_ts ) }
    };

    let output = if sig.asyncness.is_some() {
        quote! {
            #[tokio::test #paren_args]
            #vis #sig {
                shoal::trace::with_test_tracing(stringify!(#name), || async move #block).await
            }
        }
    } else {
        quote! {
            #[test]
            #vis #sig {
                shoal::trace::with_test_tracing_sync(stringify!(#name), || #block)
            }
        }
    };
    output.into()
}
