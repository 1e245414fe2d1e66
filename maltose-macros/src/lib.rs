use proc_macro::TokenStream;

mod controller;
mod reflect;

/// Derives `maltose::reflect::Reflect`.
///
/// Field metadata goes in `#[tag(...)]`, either as `key = "value"` pairs or
/// as one raw `key:"value"` string. Serde `rename`, `rename_all` and `skip`
/// are honoured so reflected names match the wire.
///
/// # Example
///
/// ```ignore
/// use maltose::prelude::*;
///
/// #[derive(Deserialize, Reflect)]
/// struct CreateUser {
///     #[tag(path = "/users", method = "post", summary = "Create a user")]
///     meta: Meta,
///     /// Login email.
///     #[tag(json = "email", binding = "required,email")]
///     email: String,
/// }
/// ```
///
/// Structs with named fields, newtypes, unit structs and enums whose
/// variants are all units are supported.
#[proc_macro_derive(Reflect, attributes(tag))]
pub fn derive_reflect(input: TokenStream) -> TokenStream {
    reflect::derive_reflect_impl(input.into())
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Turns an inherent `impl` block into a `maltose::controller::Controller`.
///
/// Every method taking `&self` is inspected. Methods shaped like
/// `async fn name(&self, ctx: &RequestContext, req: Req) -> Result<Res, E>`
/// become endpoints; any other method is reported as rejected when the
/// controller is bound. Associated functions are left alone.
///
/// ```ignore
/// struct Users;
///
/// #[controller]
/// impl Users {
///     async fn create(&self, _ctx: &RequestContext, req: CreateUser) -> Result<UserRes> {
///         Ok(UserRes { email: req.email })
///     }
/// }
/// ```
#[proc_macro_attribute]
pub fn controller(attr: TokenStream, item: TokenStream) -> TokenStream {
    controller::controller_impl(attr.into(), item.into())
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
