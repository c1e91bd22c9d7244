use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse::Parse, parse_macro_input, spanned::Spanned, FnArg, GenericArgument, ImplItem,
    ImplItemFn, ItemImpl, LitStr, PathArguments, ReturnType, Token, Type,
};

/// `name = "..", description = ".."` attribute arguments.
struct ToolArgs {
    name: LitStr,
    description: LitStr,
}

impl Parse for ToolArgs {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut name = None;
        let mut description = None;

        while !input.is_empty() {
            let key: syn::Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            let value: LitStr = input.parse()?;

            match key.to_string().as_str() {
                "name" => name = Some(value),
                "description" => description = Some(value),
                _ => {
                    return Err(syn::Error::new(
                        key.span(),
                        "expected 'name' or 'description'",
                    ))
                }
            }

            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(ToolArgs {
            name: name.ok_or_else(|| input.error("missing 'name' attribute"))?,
            description: description
                .ok_or_else(|| input.error("missing 'description' attribute"))?,
        })
    }
}

/// Turns an `impl` block with an async `call` method into a toolchat tool.
///
/// The macro:
/// - Uses the tool name and description given in the attribute
/// - Takes the argument type from the second parameter of `call`
/// - Checks that `call` returns `Result<T, ToolError>`
/// - Implements `ToolHandler` (deserialize arguments, call, serialize output)
/// - Implements `Tool::definition()` with a schema derived from the argument type
///
/// Arguments that fail to deserialize are reported to the model as a tool
/// failure; an output that fails to serialize is a fault.
///
/// # Example
/// ```ignore
/// #[tool(name = "get_current_weather", description = "Get the current weather in a location")]
/// impl WeatherTool {
///     async fn call(&self, input: WeatherArgs) -> Result<WeatherReport, ToolError> {
///         // Implementation
///     }
/// }
///
/// #[derive(Deserialize, JsonSchema)]
/// struct WeatherArgs {
///     /// City and state, e.g. Seattle, WA
///     location: String,
/// }
/// ```
#[proc_macro_attribute]
pub fn tool(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as ToolArgs);
    let impl_block = parse_macro_input!(item as ItemImpl);

    match expand(args, impl_block) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(args: ToolArgs, impl_block: ItemImpl) -> syn::Result<proc_macro2::TokenStream> {
    let call_method = find_call(&impl_block)?;
    let input_type = input_type(call_method)?;

    match &call_method.sig.output {
        ReturnType::Type(_, ty) if extract_result_ok_type(ty).is_some() => {}
        output => {
            return Err(syn::Error::new(
                output.span(),
                "call method must return Result<T, ToolError>",
            ))
        }
    }

    let tool_name = &args.name;
    let tool_description = &args.description;
    let self_ty = &impl_block.self_ty;
    let (impl_generics, _, where_clause) = impl_block.generics.split_for_impl();

    Ok(quote! {
        #impl_block

        #[::toolchat::async_trait::async_trait]
        impl #impl_generics ::toolchat::ToolHandler for #self_ty #where_clause {
            async fn invoke(
                &self,
                arguments: ::toolchat::serde_json::Map<::std::string::String, ::toolchat::serde_json::Value>,
            ) -> ::std::result::Result<::toolchat::serde_json::Value, ::toolchat::ToolError> {
                let input: #input_type = ::toolchat::serde_json::from_value(
                    ::toolchat::serde_json::Value::Object(arguments),
                )
                .map_err(|e| ::toolchat::ToolError::Failed(::std::format!("invalid arguments: {}", e)))?;

                let output = self.call(input).await?;

                ::toolchat::serde_json::to_value(output)
                    .map_err(|e| ::toolchat::ToolError::Fault(::std::format!("unserializable result: {}", e)))
            }
        }

        impl #impl_generics ::toolchat::Tool for #self_ty #where_clause {
            fn definition(&self) -> ::toolchat::ToolDefinition {
                ::toolchat::ToolDefinition::new(
                    #tool_name,
                    #tool_description,
                    ::toolchat::ToolSchema::for_type::<#input_type>(),
                )
            }
        }
    })
}

fn find_call(impl_block: &ItemImpl) -> syn::Result<&ImplItemFn> {
    impl_block
        .items
        .iter()
        .find_map(|item| match item {
            ImplItem::Fn(method) if method.sig.ident == "call" => Some(method),
            _ => None,
        })
        .ok_or_else(|| {
            syn::Error::new(
                impl_block.self_ty.span(),
                "tool impl must contain an async fn call method",
            )
        })
}

/// Type of the parameter after `&self`.
fn input_type(method: &ImplItemFn) -> syn::Result<&Type> {
    if method.sig.asyncness.is_none() {
        return Err(syn::Error::new(method.sig.fn_token.span(), "call method must be async"));
    }
    method
        .sig
        .inputs
        .iter()
        .nth(1)
        .and_then(|arg| match arg {
            FnArg::Typed(pat_type) => Some(&*pat_type.ty),
            FnArg::Receiver(_) => None,
        })
        .ok_or_else(|| {
            syn::Error::new(method.sig.span(), "call method must take an input parameter")
        })
}

/// Extract the Ok type from Result<T, E>
fn extract_result_ok_type(ty: &Type) -> Option<&Type> {
    if let Type::Path(type_path) = ty {
        let segment = type_path.path.segments.last()?;
        if segment.ident == "Result" {
            if let PathArguments::AngleBracketed(args) = &segment.arguments {
                if let Some(GenericArgument::Type(ok_type)) = args.args.first() {
                    return Some(ok_type);
                }
            }
        }
    }
    None
}
