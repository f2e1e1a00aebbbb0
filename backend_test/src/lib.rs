use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, FnArg, Ident, ItemFn, Pat, Signature, Type};

/// Transform an asynchronous test into a synchronous one running against a
/// fresh in-memory store, and inject dependencies.
///
/// Injectable dependencies are [`rocket::local::asynchronous::Client`],
/// `crate::model::store::MemoryStore` (the store behind the client), and,
/// when invoked as `#[backend_test(voter)]`,
/// `crate::model::api::session::SignInResponse` for the example voter who
/// has already signed in.
#[proc_macro_attribute]
pub fn backend_test(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(input as ItemFn);
    let signed_in = parse_macro_input!(args as Option<Ident>);
    if let Some(arg) = &signed_in {
        if arg != "voter" {
            return syn::Error::new(arg.span(), "Expected `voter` or nothing")
                .into_compile_error()
                .into();
        }
    }

    // Extract type information and reject invalid function signatures.
    let test_args = match check_sig(item_fn.sig.clone(), signed_in.is_some()) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    // Sign the example voter in if needed.
    let maybe_sign_in = signed_in
        .map(|_| {
            quote! {
                let session = {
                    use crate::api::common::testing::WithFingerprint;

                    let response = rocket_client
                        .post(uri!(crate::api::auth::sign_in))
                        .header(rocket::http::ContentType::JSON)
                        .body(rocket::serde::json::json!(crate::model::api::session::SignInRequest::example()).to_string())
                        .fingerprint(&crate::model::fingerprint::Fingerprint::example())
                        .dispatch()
                        .await;
                    assert_eq!(response.status(), rocket::http::Status::Ok);
                    response
                        .into_json::<crate::model::api::session::SignInResponse>()
                        .await
                        .unwrap()
                };
                let _ = &session;
            }
        })
        .unwrap_or_default();

    // Rewrite the test function.
    quote! {
        #[test]
        fn #name() {
            /// Test setup.
            async fn setup() -> (rocket::local::asynchronous::Client, crate::model::store::MemoryStore) {
                log4rs_test_utils::test_logging::init_logging_once_for(["campus_ballot"], None, None);
                let store = crate::model::store::MemoryStore::new();
                let service = crate::service::VotingService::example(store.clone());
                let rocket_client = rocket::local::asynchronous::Client::tracked(crate::rocket_for_service(service))
                    .await
                    .unwrap();
                (rocket_client, store)
            }

            /// The test itself.
            #item_fn

            // Each test gets its own runtime and store, so nothing needs
            // cleaning up afterwards.
            let runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("rocket-worker-test-thread")
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let (rocket_client, store) = setup().await;
                let _ = &store;

                #maybe_sign_in

                #new_name(#(#test_args),*).await;
            });
        }
    }
    .into()
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject unknown parameters.
fn check_sig(sig: Signature, signed_in: bool) -> Result<Vec<TokenStream2>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut has_client = false;
    let mut has_store = false;
    let mut has_session = false;
    let mut args = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let (Pat::Ident(_), Type::Path(type_path)) = (&*pat_type.pat, &*pat_type.ty) {
                if let Some(type_ident) = type_path.path.get_ident() {
                    let (seen, arg, what) = if type_ident == "Client" {
                        (
                            &mut has_client,
                            quote! { rocket_client },
                            "`rocket::local::asynchronous::Client`",
                        )
                    } else if type_ident == "MemoryStore" {
                        (&mut has_store, quote! { store }, "`MemoryStore`")
                    } else if type_ident == "SignInResponse" {
                        if !signed_in {
                            return Err(syn::Error::new(
                                input.span(),
                                "`SignInResponse` is only available with `#[backend_test(voter)]`",
                            ));
                        }
                        (&mut has_session, quote! { session }, "`SignInResponse`")
                    } else {
                        return Err(unexpected(input));
                    };
                    if *seen {
                        return Err(syn::Error::new(
                            input.span(),
                            format!("Test cannot accept more than one {what}"),
                        ));
                    }
                    *seen = true;
                    args.push(arg);
                    continue;
                }
            }
        }

        return Err(unexpected(input));
    }

    Ok(args)
}

fn unexpected(input: &FnArg) -> syn::Error {
    syn::Error::new(
        input.span(),
        "Expected one of `client_ident: Client`, `store_ident: MemoryStore` or `session_ident: SignInResponse`",
    )
}
