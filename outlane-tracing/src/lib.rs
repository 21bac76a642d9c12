extern crate proc_macro;

use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::{ItemFn, Stmt, parse::Parse, parse_macro_input, parse_quote};

/// Unit used when reporting how long the attributed function ran for.
#[derive(PartialEq, Eq, Clone, Copy, Default)]
enum Precision {
    #[default]
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl Precision {
    /// Expression converting the guard's `Instant` into a `u128` of this unit.
    fn elapsed(self) -> syn::Expr {
        match self {
            Self::Nanos => parse_quote!(self.timer.elapsed().as_nanos()),
            Self::Micros => parse_quote!(self.timer.elapsed().as_micros()),
            Self::Millis => parse_quote!(self.timer.elapsed().as_millis()),
            Self::Seconds => parse_quote!(u128::from(self.timer.elapsed().as_secs())),
        }
    }

    const fn unit(self) -> &'static str {
        match self {
            Self::Nanos => "ns",
            Self::Micros => "us",
            Self::Millis => "ms",
            Self::Seconds => "s",
        }
    }
}

impl TryFrom<&str> for Precision {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "ns" | "nanos" | "nanoseconds" => Ok(Self::Nanos),
            "us" | "micros" | "microseconds" => Ok(Self::Micros),
            "ms" | "millis" | "milliseconds" => Ok(Self::Millis),
            "s" | "secs" | "seconds" => Ok(Self::Seconds),
            other => Err(format!("unknown precision `{other}`")),
        }
    }
}

mod keywords {
    syn::custom_keyword!(timing);
    syn::custom_keyword!(precision);
    syn::custom_keyword!(instrument);
}

impl Parse for Precision {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        if !input.peek(syn::token::Paren) {
            return Ok(Self::default());
        }

        let content;
        let _ = syn::parenthesized!(content in input);
        let _ = content.parse::<keywords::precision>()?;
        let _ = content.parse::<syn::Token![=]>()?;
        let literal = content.parse::<syn::LitStr>()?;

        Self::try_from(literal.value().as_str())
            .map_err(|message| syn::Error::new(literal.span(), message))
    }
}

#[derive(Default)]
struct Attributes {
    timing: Option<Precision>,
    instrument: Option<TokenStream>,
    unrecognised: Vec<syn::Error>,
}

impl Attributes {
    /// Surfaces unrecognised arguments as deprecation warnings rather than hard errors.
    fn warnings(&self) -> TokenStream {
        let warnings = self.unrecognised.iter().map(|err| {
            let msg = syn::LitStr::new(&format!("ignored `traced` argument, {err}"), err.span());

            quote_spanned! {err.span()=>
                #[warn(deprecated)]
                {
                    #[deprecated(note = #msg)]
                    const TRACED_ARGUMENT_IGNORED: () = ();
                    let () = TRACED_ARGUMENT_IGNORED;
                }
            }
        });

        quote! { #(#warnings)* }
    }
}

impl Parse for Attributes {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut attributes = Self::default();

        while !input.is_empty() {
            let lookahead = input.lookahead1();
            if lookahead.peek(keywords::timing) {
                if attributes.timing.is_some() {
                    return Err(input.error("`timing` may only be given once"));
                }
                let _ = input.parse::<keywords::timing>()?;
                attributes.timing = Some(input.parse()?);
            } else if lookahead.peek(keywords::instrument) {
                if attributes.instrument.is_some() {
                    return Err(input.error("`instrument` may only be given once"));
                }
                let _ = input.parse::<keywords::instrument>()?;
                let content;
                let _ = syn::parenthesized!(content in input);
                attributes.instrument = Some(content.parse()?);
            } else if lookahead.peek(syn::Token![,]) {
                let _ = input.parse::<syn::Token![,]>()?;
            } else {
                attributes.unrecognised.push(lookahead.error());
                let _ = input.parse::<proc_macro2::TokenTree>()?;
            }
        }

        Ok(attributes)
    }
}

/// Emits `tracing::trace!` events when the attributed function is entered and
/// when it returns, optionally recording the elapsed time and wrapping the
/// body in `#[tracing::instrument]`.
///
/// ```ignore
/// #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
/// async fn deliver(&self) -> Result<(), Error> { .. }
/// ```
///
/// The exit event is emitted from a drop guard, so it fires on early returns
/// and `?` propagation as well.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let args = parse_macro_input!(args as Attributes);
    let mut item_fn = parse_macro_input!(item as ItemFn);
    let warnings = args.warnings();

    item_fn
        .attrs
        .push(parse_quote! { #[allow(clippy::items_after_statements)] });

    if let Some(fields) = &args.instrument {
        item_fn
            .attrs
            .push(parse_quote! { #[tracing::instrument(#fields)] });
    }

    let name = item_fn.sig.ident.to_string();
    let on_exit: Stmt = match args.timing {
        Some(precision) => {
            let elapsed = precision.elapsed();
            let unit = precision.unit();
            parse_quote! {
                tracing::trace!(elapsed = #elapsed, unit = #unit, "OnExit: {}", #name);
            }
        }
        None => parse_quote! {
            {
                let _ = self.timer;
                tracing::trace!("OnExit: {}", #name);
            }
        },
    };

    let guard: Vec<Stmt> = parse_quote! {
        struct __TracedGuard {
            timer: std::time::Instant,
        }

        impl __TracedGuard {
            fn enter() -> Self {
                #warnings
                tracing::trace!("OnEnter: {}", #name);
                Self {
                    timer: std::time::Instant::now(),
                }
            }
        }

        impl std::ops::Drop for __TracedGuard {
            fn drop(&mut self) {
                #on_exit
            }
        }

        let __traced_guard = __TracedGuard::enter();
    };

    let mut stmts = guard;
    stmts.append(&mut item_fn.block.stmts);
    item_fn.block.stmts = stmts;

    proc_macro::TokenStream::from(quote! { #item_fn })
}
