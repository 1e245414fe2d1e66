use proc_macro2::TokenStream;
use quote::quote;
use syn::{FnArg, ImplItem, ImplItemFn, ItemImpl, LitStr, ReturnType, Type};

/// Why a method does not have the endpoint shape, if it doesn't.
fn rejection(method: &ImplItemFn) -> Option<&'static str> {
    let sig = &method.sig;
    if sig.asyncness.is_none() {
        return Some("endpoint methods must be async");
    }
    if !sig.generics.params.is_empty() {
        return Some("endpoint methods cannot be generic");
    }
    match sig.inputs.first() {
        Some(FnArg::Receiver(receiver))
            if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => return Some("endpoint methods must take &self"),
    }
    let params: Vec<&Type> = sig
        .inputs
        .iter()
        .skip(1)
        .filter_map(|arg| match arg {
            FnArg::Typed(pat) => Some(&*pat.ty),
            FnArg::Receiver(_) => None,
        })
        .collect();
    if params.len() != 2 {
        return Some("expected exactly two parameters: a context reference and a request");
    }
    if !matches!(params[0], Type::Reference(r) if r.mutability.is_none()) {
        return Some("the first parameter must be a shared context reference");
    }
    if matches!(params[1], Type::Reference(_)) {
        return Some("the request must be taken by value");
    }
    match &sig.output {
        ReturnType::Type(_, ty) if returns_result(ty) => None,
        _ => Some("endpoint methods must return a Result"),
    }
}

fn returns_result(ty: &Type) -> bool {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Result"),
        _ => false,
    }
}

fn request_type(method: &ImplItemFn) -> Option<&Type> {
    match method.sig.inputs.iter().nth(2) {
        Some(FnArg::Typed(pat)) => Some(&pat.ty),
        _ => None,
    }
}

pub(crate) fn controller_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    if !attr.is_empty() {
        return Err(syn::Error::new_spanned(attr, "#[controller] takes no arguments"));
    }
    let block: ItemImpl = syn::parse2(item)?;
    if let Some((_, path, _)) = &block.trait_ {
        return Err(syn::Error::new_spanned(
            path,
            "#[controller] goes on an inherent impl block",
        ));
    }
    if !block.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &block.generics,
            "#[controller] does not support generic impl blocks",
        ));
    }

    let self_ty = &block.self_ty;
    let mut endpoints = Vec::new();

    for item in &block.items {
        let ImplItem::Fn(method) = item else {
            continue;
        };
        // associated functions are not methods of the controller
        if !matches!(method.sig.inputs.first(), Some(FnArg::Receiver(_))) {
            continue;
        }

        let ident = &method.sig.ident;
        let name = LitStr::new(&ident.to_string(), ident.span());
        let endpoint = match (rejection(method), request_type(method)) {
            (None, Some(req)) => quote! {
                maltose::controller::Endpoint::bindable(
                    #name,
                    |__maltose_this: ::std::sync::Arc<Self>,
                     __maltose_ctx: maltose::context::RequestContext,
                     __maltose_req: #req| async move {
                        __maltose_this
                            .#ident(&__maltose_ctx, __maltose_req)
                            .await
                            .map_err(::std::convert::Into::<maltose::error::Error>::into)
                    },
                )
            },
            (reason, _) => {
                let reason = reason.unwrap_or("expected exactly two parameters");
                quote! { maltose::controller::Endpoint::rejected(#name, #reason) }
            }
        };
        endpoints.push(endpoint);
    }

    Ok(quote! {
        #block

        impl maltose::controller::Controller for #self_ty {
            fn endpoints() -> ::std::vec::Vec<maltose::controller::Endpoint<Self>> {
                vec![#(#endpoints),*]
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(item: TokenStream) -> String {
        controller_impl(TokenStream::new(), item).unwrap().to_string()
    }

    #[test]
    fn test_bindable_method() {
        let output = expand(quote! {
            impl Hello {
                async fn say(&self, ctx: &RequestContext, req: HelloReq) -> Result<HelloRes> {
                    Ok(HelloRes::default())
                }
            }
        });

        assert!(output.contains("impl maltose :: controller :: Controller for Hello"));
        assert!(output.contains("Endpoint :: bindable (\"say\""));
        assert!(output.contains("__maltose_req : HelloReq"));
        assert!(output.contains(". say (& __maltose_ctx , __maltose_req)"));
        // the original block is kept
        assert!(output.contains("async fn say"));
    }

    #[test]
    fn test_rejected_methods() {
        let output = expand(quote! {
            impl Hello {
                fn sync(&self, ctx: &RequestContext, req: HelloReq) -> Result<HelloRes> {
                    todo!()
                }
                async fn one(&self, req: HelloReq) -> Result<HelloRes> {
                    todo!()
                }
                async fn plain(&self, ctx: &RequestContext, req: HelloReq) -> HelloRes {
                    todo!()
                }
                async fn owned(self, ctx: &RequestContext, req: HelloReq) -> Result<HelloRes> {
                    todo!()
                }
            }
        });

        assert!(output.contains("Endpoint :: rejected (\"sync\" , \"endpoint methods must be async\")"));
        assert!(output.contains("Endpoint :: rejected (\"one\""));
        assert!(output.contains("Endpoint :: rejected (\"plain\" , \"endpoint methods must return a Result\")"));
        assert!(output.contains("Endpoint :: rejected (\"owned\" , \"endpoint methods must take &self\")"));
        assert!(!output.contains("bindable"));
    }

    #[test]
    fn test_associated_functions_ignored() {
        let output = expand(quote! {
            impl Hello {
                fn new() -> Self {
                    Hello
                }
            }
        });
        assert!(output.contains("vec ! []"));
    }

    #[test]
    fn test_trait_impl_is_an_error() {
        let err = controller_impl(
            TokenStream::new(),
            quote! {
                impl Default for Hello {
                    fn default() -> Self { Hello }
                }
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("inherent impl block"));
    }
}
