use syn::{Field, FieldsNamed, Type};

pub(crate) fn has_field(fields_named: &FieldsNamed, name: &str) -> bool {
    fields_named
        .named
        .iter()
        .any(|f| f.ident.as_ref().is_some_and(|i| i == name))
}

/// 缺失时在最前追加字段，已存在则保持原定义与顺序
pub(crate) fn ensure_leading_field(fields_named: &mut FieldsNamed, name: &syn::Ident, ty: &Type) {
    if has_field(fields_named, &name.to_string()) {
        return;
    }

    let field: Field = syn::parse_quote! { #name: #ty };
    let rest = std::mem::take(&mut fields_named.named);
    fields_named.named.push(field);
    fields_named.named.extend(rest);
}
