extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::spanned::Spanned;

const DEFAULT_THREADS: usize = 2;

struct Options {
    threads: usize,
    name: Option<String>,
    runtime_crate: syn::Path,
}

impl Default for Options {
    fn default() -> Options {
        Options { threads: DEFAULT_THREADS, name: None, runtime_crate: syn::parse_quote!(strand) }
    }
}

fn positive_int(lit: &syn::Lit) -> Option<usize> {
    let syn::Lit::Int(int) = lit else {
        return None;
    };
    int.base10_parse().ok().filter(|n| *n > 0)
}

fn string_value(lit: &syn::Lit) -> Option<String> {
    let syn::Lit::Str(s) = lit else {
        return None;
    };
    Some(s.value())
}

fn parse_options(args: syn::AttributeArgs) -> syn::Result<Options> {
    let mut options = Options::default();
    let mut seen = Vec::new();
    for arg in args {
        let pair = match arg {
            syn::NestedMeta::Meta(syn::Meta::NameValue(pair)) => pair,
            other => return Err(syn::Error::new(other.span(), "options take the form `name = value`")),
        };
        let name = match pair.path.get_ident() {
            Some(ident) => ident.to_string(),
            None => return Err(syn::Error::new(pair.path.span(), "option names are plain identifiers")),
        };
        if seen.contains(&name) {
            return Err(syn::Error::new(pair.span(), format!("option `{}` given twice", name)));
        }
        match name.as_str() {
            "threads" => {
                options.threads = positive_int(&pair.lit)
                    .ok_or_else(|| syn::Error::new(pair.lit.span(), "`threads` wants a positive integer"))?;
            },
            "name" => {
                options.name = Some(
                    string_value(&pair.lit)
                        .ok_or_else(|| syn::Error::new(pair.lit.span(), "`name` wants a string"))?,
                );
            },
            "crate" => {
                options.runtime_crate = string_value(&pair.lit)
                    .and_then(|value| syn::parse_str::<syn::Path>(&value).ok())
                    .ok_or_else(|| syn::Error::new(pair.lit.span(), "`crate` wants a string naming a path"))?;
            },
            other => {
                return Err(syn::Error::new(pair.path.span(), format!("unknown option `{}`", other)));
            },
        }
        seen.push(name);
    }
    Ok(options)
}

fn expand(is_test: bool, options: Options, function: syn::ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    if let Some(asyncness) = &function.sig.asyncness {
        let which = if is_test { "#[strand::test]" } else { "#[strand::main]" };
        return Err(syn::Error::new(
            asyncness.span(),
            format!("{} runs plain functions as fibers; drop the `async`", which),
        ));
    }
    if !is_test && function.sig.ident != "main" {
        return Err(syn::Error::new(function.sig.ident.span(), "#[strand::main] only goes on `main`"));
    }

    let syn::ItemFn { attrs, vis, sig, block } = function;
    let name = &sig.ident;
    let inputs = &sig.inputs;
    let output = &sig.output;
    let threads = options.threads;
    let label = options.name.unwrap_or_else(|| name.to_string());
    let runtime_crate = &options.runtime_crate;
    let test_header = is_test.then(|| quote!(#[::core::prelude::v1::test]));

    Ok(quote! {
        #test_header
        #(#attrs)*
        #vis fn #name() #output {
            fn entry(#inputs) #output #block

            let io_manager = #runtime_crate::reactor::IoManager::new(#threads, true, #label);
            #runtime_crate::hook::set_enabled(true);
            let (sender, receiver) = ::std::sync::mpsc::channel();
            io_manager.spawn(move || {
                let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(entry));
                let _ = sender.send(result);
            });
            io_manager.stop();
            match receiver.recv().expect("entry function did not complete") {
                Ok(value) => value,
                Err(err) => ::std::panic::resume_unwind(err),
            }
        }
    })
}

fn runtime_entry(is_test: bool, attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = syn::parse_macro_input!(attr as syn::AttributeArgs);
    let function = syn::parse_macro_input!(item as syn::ItemFn);
    parse_options(args)
        .and_then(|options| expand(is_test, options, function))
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Runs the marked main function as a fiber of a dedicated IoManager with
/// blocking-call interposition enabled. The manager stops, draining all
/// remaining work, when the function returns.
///
/// ## Options
/// * `threads`: worker thread count of the IoManager, the calling thread
///   included; defaults to 2
/// * `name`: IoManager name used in worker thread names; defaults to the
///   function name
/// * `crate`: path of the runtime crate, for renamed dependencies
///
/// ## Examples
/// ```rust
/// #[strand::main]
/// fn main() {
///     strand::scheduler::yield_now();
/// }
/// ```
///
/// ```rust
/// #[strand::main(threads = 4, name = "pool")]
/// fn main() {
///     strand::scheduler::yield_now();
/// }
/// ```
#[cfg(not(test))]
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    runtime_entry(false, attr, item)
}

/// Runs the marked test function as a fiber of a dedicated IoManager with
/// blocking-call interposition enabled. Panics inside the fiber fail the
/// test instead of tearing down the process.
///
/// See [macro@main] for configurable options.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    runtime_entry(true, attr, item)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(args: Vec<syn::NestedMeta>) -> syn::Result<Options> {
        parse_options(args)
    }

    fn path_string(path: &syn::Path) -> String {
        quote!(#path).to_string()
    }

    #[test]
    fn defaults() {
        let options = options(vec![]).unwrap();
        assert_eq!(options.threads, DEFAULT_THREADS);
        assert!(options.name.is_none());
        assert_eq!(path_string(&options.runtime_crate), "strand");
    }

    #[test]
    fn threads_and_name() {
        let options = options(vec![syn::parse_quote!(threads = 8), syn::parse_quote!(name = "pool")]).unwrap();
        assert_eq!(options.threads, 8);
        assert_eq!(options.name.as_deref(), Some("pool"));
    }

    #[test]
    fn crate_path() {
        let options = options(vec![syn::parse_quote!(crate = "renamed")]).unwrap();
        assert_eq!(path_string(&options.runtime_crate), "renamed");
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(options(vec![syn::parse_quote!(threads = 0)]).is_err());
        assert!(options(vec![syn::parse_quote!(threads = "many")]).is_err());
        assert!(options(vec![syn::parse_quote!(name = 3)]).is_err());
        assert!(options(vec![syn::parse_quote!(burst = 1)]).is_err());
        assert!(options(vec![syn::parse_quote!(threads = 1), syn::parse_quote!(threads = 2)]).is_err());
        assert!(options(vec![syn::parse_quote!(quiet)]).is_err());
    }

    #[test]
    fn rejects_async_functions() {
        let function: syn::ItemFn = syn::parse_quote! {
            async fn main() {}
        };
        let err = expand(false, Options::default(), function).unwrap_err();
        assert!(err.to_string().contains("drop the `async`"));
    }

    #[test]
    fn rejects_misplaced_main() {
        let function: syn::ItemFn = syn::parse_quote! {
            fn elsewhere() {}
        };
        let err = expand(false, Options::default(), function).unwrap_err();
        assert!(err.to_string().contains("only goes on `main`"));

        let function: syn::ItemFn = syn::parse_quote! {
            fn any_test_name() {}
        };
        assert!(expand(true, Options::default(), function).is_ok());
    }
}
