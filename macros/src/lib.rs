use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

/// Derives `utils::endian::Wire` for a plain struct whose fields are
/// themselves `Wire` types, reading and writing them in declaration order.
///
/// Unlike reinterpreting a byte slice in place (which requires the struct to
/// be `repr(C)` with no padding and an unsafe transmute), each field is
/// read/written individually through its own `Wire` impl, so the wire
/// layout stays identical without any unsafe code.
#[proc_macro_derive(Wire)]
pub fn derive_wire(item: TokenStream) -> TokenStream {
	let DeriveInput { ident, data, generics, .. } = parse_macro_input!(item as DeriveInput);

	let fields = match data {
		Data::Struct(s) => match s.fields {
			Fields::Named(named) => named.named,
			_ => return syn::Error::new_spanned(ident, "Wire can only be derived for structs with named fields").to_compile_error().into(),
		},
		_ => return syn::Error::new_spanned(ident, "Wire can only be derived for structs").to_compile_error().into(),
	};

	let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

	let field_names: Vec<_> = fields.iter().map(|f| f.ident.clone().unwrap()).collect();
	let field_types: Vec<_> = fields.iter().map(|f| f.ty.clone()).collect();

	let size_terms = field_types.iter().map(|ty| quote! { <#ty as utils::endian::Wire>::SIZE });

	let write_stmts = field_names.iter().zip(field_types.iter()).map(|(name, ty)| {
		quote! {
			<#ty as utils::endian::Wire>::write(&self.#name, &mut out[off..off + <#ty as utils::endian::Wire>::SIZE]);
			off += <#ty as utils::endian::Wire>::SIZE;
		}
	});

	let read_stmts = field_names.iter().zip(field_types.iter()).map(|(name, ty)| {
		quote! {
			let #name = <#ty as utils::endian::Wire>::read(&bytes[off..off + <#ty as utils::endian::Wire>::SIZE]);
			off += <#ty as utils::endian::Wire>::SIZE;
		}
	});

	let expanded = quote! {
		impl #impl_generics utils::endian::Wire for #ident #ty_generics #where_clause {
			const SIZE: usize = 0 #( + #size_terms )*;

			fn write(&self, out: &mut [u8]) {
				assert!(out.len() >= Self::SIZE);
				#[allow(unused_mut, unused_assignments)]
				let mut off = 0usize;
				#( #write_stmts )*
			}

			fn read(bytes: &[u8]) -> Self {
				assert!(bytes.len() >= Self::SIZE);
				#[allow(unused_mut, unused_assignments)]
				let mut off = 0usize;
				#( #read_stmts )*
				Self { #( #field_names ),* }
			}
		}
	};

	expanded.into()
}
