//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` an async one
//! driven by a current-thread runtime. Both accept an optional bound:
//! a bare integer (seconds), `secs = N` or `millis = N`. The default is 60s.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_MILLIS: u64 = 60_000;

struct Bound {
    millis: u64,
}

impl Parse for Bound {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Self {
                millis: DEFAULT_MILLIS,
            });
        }

        let millis = if input.peek(LitInt) {
            let secs: LitInt = input.parse()?;
            secs.base10_parse::<u64>()?.saturating_mul(1000)
        } else {
            let unit: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            let value: LitInt = input.parse()?;
            let value = value.base10_parse::<u64>()?;
            match unit.to_string().as_str() {
                "secs" => value.saturating_mul(1000),
                "millis" => value,
                _ => {
                    return Err(syn::Error::new_spanned(
                        unit,
                        "expected `secs = N` or `millis = N`",
                    ))
                }
            }
        };

        if !input.is_empty() {
            return Err(input.error("unexpected tokens after timeout"));
        }
        if millis == 0 {
            return Err(input.error("timeout must be greater than zero"));
        }
        Ok(Self { millis })
    }
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let bound = parse_macro_input!(attr as Bound);
    let item = parse_macro_input!(item as ItemFn);

    if item.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &item.sig.ident,
            "use tokio_timeout_test for async test functions",
        )
        .to_compile_error()
        .into();
    }

    let block = &item.block;
    let run = quote! { (|| #block)() };
    expand(item.attrs, item.vis, item.sig, bound, run)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let bound = parse_macro_input!(attr as Bound);
    let item = parse_macro_input!(item as ItemFn);

    if item.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &item.sig.ident,
            "tokio_timeout_test expects an async function",
        )
        .to_compile_error()
        .into();
    }

    let mut sig = item.sig;
    sig.asyncness = None;
    let block = &item.block;
    let millis = bound.millis;
    let run = quote! {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build test runtime")
            .block_on(async move {
                tokio::time::timeout(
                    std::time::Duration::from_millis(#millis),
                    async move #block,
                )
                .await
                .expect("test timed out inside runtime")
            })
    };
    expand(item.attrs, item.vis, sig, bound, run)
}

/// Emits a `#[test]` that runs `run` on a named worker thread and fails once
/// the bound elapses. Panics from the worker are re-raised on the test thread.
fn expand(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    bound: Bound,
    run: TokenStream2,
) -> TokenStream {
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();
    let millis = bound.millis;
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_millis(#millis);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#name.to_string())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        #run
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn test thread");
            match done_rx.recv_timeout(limit) {
                Ok(Ok(_)) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} exceeded {:?}", #name, limit)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} worker exited without reporting", #name)
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` are dropped; the expansion adds its own.
fn is_test_marker(attr: &Attribute) -> bool {
    let path: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        path.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
