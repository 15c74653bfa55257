extern crate proc_macro;

use proc_macro2::TokenStream;
use quote::{quote, ToTokens};
use syn::parse::Result;
use syn::spanned::Spanned;
use syn::{parse_macro_input, ItemFn, LitInt, LitStr, ReturnType};

#[derive(Default)]
struct TestArgs {
    timeout_ms: Option<LitInt>,
    abort_grace_ms: Option<LitInt>,
    thread_name: Option<LitStr>,
}

impl TestArgs {
    fn parse_meta(&mut self, meta: syn::meta::ParseNestedMeta) -> Result<()> {
        if meta.path.is_ident("timeout_ms") {
            self.timeout_ms = Some(meta.value()?.parse()?);
        } else if meta.path.is_ident("abort_grace_ms") {
            self.abort_grace_ms = Some(meta.value()?.parse()?);
        } else if meta.path.is_ident("thread_name") {
            self.thread_name = Some(meta.value()?.parse()?);
        } else {
            return Err(meta.error(
                "unsupported pump_test option, expected `timeout_ms`, `abort_grace_ms` or `thread_name`",
            ));
        }
        Ok(())
    }
}

/// Marks an `async fn` as a test driven by the testpump runtime.
///
/// The function runs on its own thread and every continuation of its
/// asynchronous work runs on that thread. A function returning `Result`
/// fails the test when it returns `Err`.
///
/// ```ignore
/// #[testpump::pump_test(timeout_ms = 500)]
/// async fn answers() {
///     assert_eq!(compute().await, 42);
/// }
/// ```
#[proc_macro_attribute]
pub fn pump_test(
    attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let mut args = TestArgs::default();
    let parser = syn::meta::parser(|meta| args.parse_meta(meta));
    parse_macro_input!(attr with parser);
    let func = parse_macro_input!(item as ItemFn);

    expand(args, func)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(args: TestArgs, func: ItemFn) -> Result<TokenStream> {
    let sig = &func.sig;
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(
            sig.fn_token.span(),
            "#[pump_test] requires an async fn",
        ));
    }
    if !sig.inputs.is_empty() {
        return Err(syn::Error::new(
            sig.inputs.span(),
            "#[pump_test] functions take no arguments",
        ));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new(
            sig.generics.span(),
            "#[pump_test] functions cannot be generic",
        ));
    }

    let attrs = &func.attrs;
    let vis = &func.vis;
    let name = &sig.ident;
    let output = &sig.output;
    let body = &func.block;

    let mut config = quote! { ::testpump::Config::builder().with_env_overrides() };
    if let Some(ms) = &args.timeout_ms {
        config.extend(quote! { .with_timeout_ms(#ms) });
    }
    if let Some(ms) = &args.abort_grace_ms {
        config.extend(quote! { .with_abort_grace_ms(#ms) });
    }
    let thread_name = match &args.thread_name {
        Some(lit) => lit.to_token_stream(),
        None => {
            let lit = LitStr::new(&name.to_string(), name.span());
            lit.to_token_stream()
        }
    };
    config.extend(quote! { .with_thread_name(#thread_name).build() });

    let task = match output {
        ReturnType::Default => quote! { ::testpump::Task::new(__pump_test_body()) },
        ReturnType::Type(..) => quote! { ::testpump::Task::fallible(__pump_test_body()) },
    };

    Ok(quote! {
        #(#attrs)*
        #[test]
        #vis fn #name() {
            async fn __pump_test_body() #output #body

            let config = #config;
            ::testpump::run_test(config, || {
                ::std::option::Option::Some(::testpump::AnyValue::new(#task))
            })
            .assert_passed();
        }
    })
}
