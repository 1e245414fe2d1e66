use heck::{
    ToKebabCase, ToLowerCamelCase, ToShoutyKebabCase, ToShoutySnakeCase, ToSnakeCase,
    ToUpperCamelCase,
};
use proc_macro2::TokenStream;
use quote::quote;
use syn::ext::IdentExt;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Data, DeriveInput, Fields, Ident, LitStr, Token};

/// `#[tag(key = "value", ...)]` or `#[tag("key:\"value\"")]`.
enum TagArgs {
    Raw(LitStr),
    Pairs(Punctuated<TagPair, Token![,]>),
}

struct TagPair {
    key: Ident,
    value: LitStr,
}

impl Parse for TagPair {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        // keys such as `in` or `type` are keywords
        let key = Ident::parse_any(input)?;
        input.parse::<Token![=]>()?;
        let value = input.parse()?;
        Ok(Self { key, value })
    }
}

impl Parse for TagArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitStr) {
            let raw = input.parse()?;
            if !input.is_empty() {
                return Err(input.error("expected a single tag string"));
            }
            return Ok(TagArgs::Raw(raw));
        }
        Ok(TagArgs::Pairs(Punctuated::parse_terminated(input)?))
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Joins every `#[tag]` on a field into one `key:"value"` string.
fn tag_string(attrs: &[Attribute]) -> syn::Result<String> {
    let mut parts = Vec::new();
    for attr in attrs.iter().filter(|a| a.path().is_ident("tag")) {
        match attr.parse_args::<TagArgs>()? {
            TagArgs::Raw(raw) => parts.push(raw.value()),
            TagArgs::Pairs(pairs) => {
                for pair in pairs {
                    parts.push(format!(
                        "{}:\"{}\"",
                        pair.key.unraw(),
                        escape(&pair.value.value())
                    ));
                }
            }
        }
    }
    Ok(parts.join(" "))
}

fn doc_string(attrs: &[Attribute]) -> String {
    attrs
        .iter()
        .filter(|a| a.path().is_ident("doc"))
        .filter_map(|a| match &a.meta {
            syn::Meta::NameValue(nv) => match &nv.value {
                syn::Expr::Lit(syn::ExprLit {
                    lit: syn::Lit::Str(s),
                    ..
                }) => Some(s.value().trim().to_string()),
                _ => None,
            },
            _ => None,
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Default)]
struct SerdeAttrs {
    rename: Option<String>,
    rename_all: Option<String>,
    skip: bool,
}

/// Reads the serde attributes that change names or drop fields. Anything
/// else is left for serde to check.
fn serde_attrs(attrs: &[Attribute]) -> SerdeAttrs {
    let mut out = SerdeAttrs::default();
    for attr in attrs.iter().filter(|a| a.path().is_ident("serde")) {
        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                if meta.input.peek(Token![=]) {
                    out.rename = Some(meta.value()?.parse::<LitStr>()?.value());
                } else {
                    meta.parse_nested_meta(|inner| {
                        let value = inner.value()?.parse::<LitStr>()?.value();
                        if inner.path.is_ident("serialize") {
                            out.rename = Some(value);
                        }
                        Ok(())
                    })?;
                }
            } else if meta.path.is_ident("rename_all") {
                if meta.input.peek(Token![=]) {
                    out.rename_all = Some(meta.value()?.parse::<LitStr>()?.value());
                } else {
                    meta.parse_nested_meta(|inner| {
                        let value = inner.value()?.parse::<LitStr>()?.value();
                        if inner.path.is_ident("serialize") {
                            out.rename_all = Some(value);
                        }
                        Ok(())
                    })?;
                }
            } else if meta.path.is_ident("skip") || meta.path.is_ident("skip_serializing") {
                out.skip = true;
            } else if meta.input.peek(Token![=]) {
                meta.value()?.parse::<syn::Expr>()?;
            } else if meta.input.peek(syn::token::Paren) {
                meta.input.parse::<proc_macro2::Group>()?;
            }
            Ok(())
        });
    }
    out
}

fn rename(name: &str, rule: Option<&str>, is_variant: bool) -> String {
    let Some(rule) = rule else {
        return name.to_string();
    };
    match rule {
        "lowercase" => name.to_lowercase(),
        "UPPERCASE" => name.to_uppercase(),
        "PascalCase" => name.to_upper_camel_case(),
        "camelCase" => name.to_lower_camel_case(),
        "snake_case" if is_variant => name.to_snake_case(),
        "snake_case" => name.to_string(),
        "SCREAMING_SNAKE_CASE" => name.to_shouty_snake_case(),
        "kebab-case" => name.to_kebab_case(),
        "SCREAMING-KEBAB-CASE" => name.to_shouty_kebab_case(),
        _ => name.to_string(),
    }
}

pub(crate) fn derive_reflect_impl(input: TokenStream) -> syn::Result<TokenStream> {
    let mut input: DeriveInput = syn::parse2(input)?;
    let name = &input.ident;
    let name_str = name.to_string();
    let container = serde_attrs(&input.attrs);
    let rule = container.rename_all.as_deref();

    let shape = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => {
                let mut entries = Vec::new();
                for field in &fields.named {
                    let ident = field.ident.as_ref().map(|i| i.unraw().to_string()).unwrap_or_default();
                    let serde = serde_attrs(&field.attrs);
                    let key = serde
                        .rename
                        .unwrap_or_else(|| rename(&ident, rule, false));
                    let tag = tag_string(&field.attrs)?;
                    let doc = doc_string(&field.attrs);
                    let skip = serde.skip;
                    let ty = &field.ty;
                    entries.push(quote! {
                        maltose::reflect::Field {
                            name: #ident,
                            key: #key,
                            tag: #tag,
                            doc: #doc,
                            skip: #skip,
                            shape: <#ty as maltose::reflect::Reflect>::shape,
                        }
                    });
                }
                quote! {
                    maltose::reflect::Shape::Struct(maltose::reflect::StructShape {
                        name: #name_str,
                        fields: vec![#(#entries),*],
                    })
                }
            }
            Fields::Unnamed(fields) if fields.unnamed.len() == 1 => {
                let ty = &fields.unnamed[0].ty;
                quote! { <#ty as maltose::reflect::Reflect>::shape() }
            }
            Fields::Unnamed(fields) => {
                return Err(syn::Error::new_spanned(
                    fields,
                    "Reflect supports newtype structs only, not tuples",
                ));
            }
            Fields::Unit => quote! { maltose::reflect::Shape::Any },
        },
        Data::Enum(data) => {
            let mut variants = Vec::new();
            for variant in &data.variants {
                if !matches!(variant.fields, Fields::Unit) {
                    return Err(syn::Error::new_spanned(
                        variant,
                        "Reflect supports enums with unit variants only",
                    ));
                }
                let serde = serde_attrs(&variant.attrs);
                if serde.skip {
                    continue;
                }
                variants.push(
                    serde
                        .rename
                        .unwrap_or_else(|| rename(&variant.ident.to_string(), rule, true)),
                );
            }
            quote! { maltose::reflect::Shape::Enum(vec![#(#variants),*]) }
        }
        Data::Union(data) => {
            return Err(syn::Error::new_spanned(
                data.union_token,
                "Reflect cannot be derived for unions",
            ));
        }
    };

    for param in input.generics.type_params_mut() {
        param.bounds.push(syn::parse_quote!(maltose::reflect::Reflect));
    }
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics maltose::reflect::Reflect for #name #ty_generics #where_clause {
            fn shape() -> maltose::reflect::Shape {
                #shape
            }
        }
    })
}
