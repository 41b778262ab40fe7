//! # Accessor Derive
//!
//! Derive macros generating builder-style setters and `const` getters for
//! configuration structs with named fields.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::punctuated::Punctuated;
use syn::token::Comma;
use syn::{Data, DeriveInput, Field, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive to generate `.set_<field>(&mut self, value: Ty) -> &mut Self` and
/// `const .with_<field>(mut self, value: Ty) -> Self` for each **named** field.
///
/// - Skipping a field: `#[setters(skip)]`
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Setters;
///
/// #[derive(Setters)]
/// struct Foo<T> where T: Default {
///     a: u32,
///     #[setters(skip)]
///     _phantom: T,
/// }
///
/// let mut f = Foo { a: 1, _phantom: u8::default() };
/// f.set_a(10).set_a(11);
/// let f2 = f.with_a(42);
/// assert_eq!(f2.a, 42);
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_generate_setters(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let fields = match named_fields(&input, "Setters") {
        Ok(fields) => fields,
        Err(e) => return e.to_compile_error().into(),
    };

    let methods = fields
        .iter()
        .filter(|field| !should_skip(&field.attrs, "setters"))
        .filter_map(|field| {
            let fname = field.ident.as_ref()?;
            let ty = &field.ty;
            let set_name = format_ident!("set_{}", fname);
            let with_name = format_ident!("with_{}", fname);
            Some(quote! {
                #[inline]
                pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                    self.#fname = value;
                    self
                }

                #[inline]
                #[must_use]
                pub const fn #with_name(mut self, value: #ty) -> Self {
                    self.#fname = value;
                    self
                }
            })
        });

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    TokenStream::from(quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    })
}

/// Derive to generate `const .<field>(&self) -> Ty` for each **named** field.
///
/// Field types must be `Copy`. Skipping a field: `#[getters(skip)]`.
///
/// # Example
///
/// ```
/// use utils_accessors_derive::{Getters, Setters};
///
/// #[derive(Clone, Copy, Default, Getters, Setters)]
/// struct Features {
///     nx: bool,
///     #[getters(skip)]
///     scratch: u8,
/// }
///
/// let f = Features::default().with_nx(true);
/// assert!(f.nx());
/// ```
#[proc_macro_derive(Getters, attributes(getters))]
pub fn derive_generate_getters(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let fields = match named_fields(&input, "Getters") {
        Ok(fields) => fields,
        Err(e) => return e.to_compile_error().into(),
    };

    let methods = fields
        .iter()
        .filter(|field| !should_skip(&field.attrs, "getters"))
        .filter_map(|field| {
            let fname = field.ident.as_ref()?;
            let ty = &field.ty;
            Some(quote! {
                #[inline]
                #[must_use]
                pub const fn #fname(&self) -> #ty {
                    self.#fname
                }
            })
        });

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    TokenStream::from(quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    })
}

fn named_fields(input: &DeriveInput, derive: &str) -> syn::Result<Punctuated<Field, Comma>> {
    match &input.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(n) => Ok(n.named.clone()),
            Fields::Unnamed(u) => Err(syn::Error::new(
                u.span(),
                format!("{derive} only supports named fields"),
            )),
            Fields::Unit => Err(syn::Error::new(
                input.ident.span(),
                format!("{derive} does not apply to unit structs"),
            )),
        },
        _ => Err(syn::Error::new(
            input.ident.span(),
            format!("{derive} can only be derived for structs"),
        )),
    }
}

fn should_skip(attrs: &[syn::Attribute], namespace: &str) -> bool {
    let mut skip = false;
    for attr in attrs {
        if !attr.path().is_ident(namespace) {
            continue;
        }

        // Accept #[ns(skip)] and #[ns(skip = true)]
        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                if meta.input.is_empty() {
                    skip = true;
                } else if let Ok(v) = meta.value()?.parse::<LitBool>()
                    && v.value
                {
                    skip = true;
                }
            }
            Ok(())
        });
    }
    skip
}
