use crate::derive_utils::apply_derives;
use crate::field_utils::ensure_leading_field;
use proc_macro::TokenStream;
use quote::quote;
use syn::ext::IdentExt;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Item, LitStr, Result, Token, Type, parse::Parse, parse::ParseStream, parse_macro_input};

/// #[message] 宏实现
/// - 仅支持具名字段结构体；缺失时在最前追加 `id: String`
/// - 合并派生：Debug, Clone, Serialize, Deserialize
/// - 生成 `::outbus_core::StructuredMessage` 实现，`TYPE` 为编译期常量且不可为空
/// - 参数：`#[message(type = "...", aggregate = "...", key = field)]`
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as MessageAttrConfig);
    let input = parse_macro_input!(item as Item);

    let mut st = match input {
        Item::Struct(s) => s,
        other => {
            return syn::Error::new(other.span(), "#[message] only on struct")
                .to_compile_error()
                .into();
        }
    };

    let Some(type_lit) = cfg.type_tag else {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "missing `type = \"...\"` in #[message]",
        )
        .to_compile_error()
        .into();
    };
    if type_lit.value().trim().is_empty() {
        return syn::Error::new(type_lit.span(), "message type tag must not be empty")
            .to_compile_error()
            .into();
    }

    let fields_named = match &mut st.fields {
        syn::Fields::Named(f) => f,
        _ => {
            return syn::Error::new(st.span(), "only supports named-field struct")
                .to_compile_error()
                .into();
        }
    };

    let id_ident: syn::Ident = syn::parse_quote!(id);
    let string_ty: Type = syn::parse_quote!(String);
    ensure_leading_field(fields_named, &id_ident, &string_ty);

    if let Some(key) = &cfg.key {
        let known = fields_named
            .named
            .iter()
            .any(|f| f.ident.as_ref().is_some_and(|i| i == key));
        if !known {
            return syn::Error::new(key.span(), format!("unknown key field `{key}`"))
                .to_compile_error()
                .into();
        }
    }

    apply_derives(
        &mut st.attrs,
        vec![
            syn::parse_quote!(Debug),
            syn::parse_quote!(Clone),
            syn::parse_quote!(serde::Serialize),
            syn::parse_quote!(serde::Deserialize),
        ],
    );

    let ident = &st.ident;
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();
    let aggregate = cfg
        .aggregate
        .unwrap_or_else(|| LitStr::new("", proc_macro2::Span::call_site()));
    let partition_key = cfg.key.map(|key| {
        quote! {
            fn partition_key(&self) -> ::std::string::String {
                ::std::string::ToString::to_string(&self.#key)
            }
        }
    });

    let expanded = quote! {
        #st

        impl #impl_generics ::outbus_core::StructuredMessage for #ident #ty_generics #where_clause {
            const TYPE: &'static str = #type_lit;
            const AGGREGATE: &'static str = #aggregate;

            fn id(&self) -> &str {
                ::core::convert::AsRef::<str>::as_ref(&self.id)
            }

            #partition_key
        }
    };

    TokenStream::from(expanded)
}

// -------- parsing --------

struct MessageAttrConfig {
    type_tag: Option<LitStr>,
    aggregate: Option<LitStr>,
    key: Option<syn::Ident>,
}

enum MessageAttrElem {
    Type(LitStr),
    Aggregate(LitStr),
    Key(syn::Ident),
}

impl Parse for MessageAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut cfg = MessageAttrConfig {
            type_tag: None,
            aggregate: None,
            key: None,
        };

        let elems = Punctuated::<MessageAttrElem, Token![,]>::parse_terminated(input)?;
        for elem in elems {
            match elem {
                MessageAttrElem::Type(lit) => set_once(&mut cfg.type_tag, lit, "type")?,
                MessageAttrElem::Aggregate(lit) => set_once(&mut cfg.aggregate, lit, "aggregate")?,
                MessageAttrElem::Key(ident) => set_once(&mut cfg.key, ident, "key")?,
            }
        }

        Ok(cfg)
    }
}

fn set_once<T: Spanned>(slot: &mut Option<T>, value: T, key: &str) -> Result<()> {
    if slot.is_some() {
        return Err(syn::Error::new(
            value.span(),
            format!("duplicate key '{key}' in attribute"),
        ));
    }
    *slot = Some(value);
    Ok(())
}

impl Parse for MessageAttrElem {
    fn parse(input: ParseStream) -> Result<Self> {
        // `type` 是关键字，需用 parse_any 读取
        let key = input.call(syn::Ident::parse_any)?;
        let _eq: Token![=] = input.parse()?;

        if key == "type" {
            Ok(MessageAttrElem::Type(input.parse()?))
        } else if key == "aggregate" {
            Ok(MessageAttrElem::Aggregate(input.parse()?))
        } else if key == "key" {
            Ok(MessageAttrElem::Key(input.parse()?))
        } else {
            Err(syn::Error::new(
                key.span(),
                "unknown key in attribute; expected 'type', 'aggregate' or 'key'",
            ))
        }
    }
}
