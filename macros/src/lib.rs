use proc_macro::{self, TokenStream};
use proc_macro2::Ident;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

///
/// A derive macro which implements TryFrom<u8> for a fieldless enum, and the
/// matching From<Enum> for u8.
///
/// Variants are matched against their declared discriminants, so enums that
/// start at 1 (like the control commands on the wire) work as well as enums
/// that start at 0.
///
/// usage:
/// ```ignore
/// #[derive(TryFromByte)]
/// ```
///
#[proc_macro_derive(TryFromByte)]
pub fn try_from_byte(input: TokenStream) -> TokenStream {
    // parse the code into DeriveInput
    let DeriveInput { ident, data, .. } = parse_macro_input!(input);
    let variants: Vec<Ident> = match data {
        syn::Data::Enum(enum_item) => enum_item
            .variants
            .into_iter()
            .map(|variant| variant.ident)
            .collect(),
        _ => panic!("TryFromByte only works on Enums"),
    };
    let error_message = format!("invalid {} value", ident);
    let output = quote! {
        impl ::std::convert::TryFrom<u8> for #ident {
            type Error = &'static str;
            fn try_from(x: u8) -> ::std::result::Result<Self, Self::Error> {
                #(
                    if x == #ident::#variants as u8 {
                        return ::std::result::Result::Ok(#ident::#variants);
                    }
                )*
                ::std::result::Result::Err(#error_message)
            }
        }
        impl ::std::convert::From<#ident> for u8 {
            fn from(x: #ident) -> u8 {
                x as u8
            }
        }
    };
    output.into()
}

///
/// A derive macro which implements the crate's Persistable save/load
/// functions.
///
/// The struct is stored as pretty-printed JSON in `<dir>/<structname>.json`,
/// where the file name is the lowercased name of the type. Both functions
/// report failures as io::Error instead of panicking, so a missing or
/// corrupt file can be handled by the caller.
///
/// usage:
/// ```ignore
/// #[derive(Serialize, Deserialize, Persistable)]
/// ```
///
#[proc_macro_derive(Persistable)]
pub fn persistable(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, .. } = parse_macro_input!(input);
    // the type name is used as the filename
    let file_name = format!("{}.json", ident.to_string().to_lowercase());
    let output = quote! {
        impl crate::storage::Persistable for #ident {
            fn file_name() -> &'static str {
                #file_name
            }
            fn save(&self, dir: &::std::path::Path) -> ::std::io::Result<()> {
                let serialized = serde_json::to_vec_pretty(self).map_err(|err| {
                    ::std::io::Error::new(::std::io::ErrorKind::InvalidData, err)
                })?;
                crate::storage::Storage::write(serialized, &dir.join(#file_name))
            }
            fn load(dir: &::std::path::Path) -> ::std::io::Result<Self> {
                let serialized = crate::storage::Storage::read(&dir.join(#file_name))?;
                serde_json::from_slice(&serialized).map_err(|err| {
                    ::std::io::Error::new(::std::io::ErrorKind::InvalidData, err)
                })
            }
        }
    };
    output.into()
}
