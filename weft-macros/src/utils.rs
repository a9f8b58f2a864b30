use proc_macro::{Delimiter, Group, TokenStream, TokenTree};

/// Options accepted by `#[weft::main]` and `#[weft::test]`.
#[derive(Default)]
pub(crate) struct Options {
    pub(crate) threads: Option<usize>,
    pub(crate) name: Option<String>,
}

impl Options {
    /// Builder expression for these options.
    pub(crate) fn builder(&self) -> String {
        let mut builder = String::from("::weft::Builder::new()");

        if let Some(n) = self.threads {
            builder.push_str(&format!(".threads({n})"));
        }
        if let Some(name) = &self.name {
            builder.push_str(&format!(".name({name:?})"));
        }

        builder
    }
}

/// Splits a `TokenStream` into comma-separated arguments.
///
/// Each argument is returned as a `Vec<TokenTree>`.
/// Commas at the top level are used as separators.
pub(crate) fn split_args(input: TokenStream) -> Vec<Vec<TokenTree>> {
    let mut args = Vec::new();
    let mut current = Vec::new();

    for token in input {
        match &token {
            TokenTree::Punct(p) if p.as_char() == ',' => {
                if !current.is_empty() {
                    args.push(current);
                    current = Vec::new();
                }
            }
            _ => current.push(token),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

/// Parses `key = value` attribute arguments.
pub(crate) fn parse_options(attr: TokenStream) -> Result<Options, String> {
    let mut options = Options::default();

    for arg in split_args(attr) {
        let (key, value) = match arg.as_slice() {
            [TokenTree::Ident(key), TokenTree::Punct(eq), TokenTree::Literal(value)]
                if eq.as_char() == '=' =>
            {
                (key.to_string(), value.to_string())
            }
            _ => return Err(format!("expected `key = value`, found `{}`", tokens_to_string(&arg))),
        };

        match key.as_str() {
            "threads" => {
                let n = value
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("`threads` must be a positive integer, found `{value}`"))?;
                options.threads = Some(n);
            }
            "name" => {
                let name = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .ok_or_else(|| format!("`name` must be a string literal, found `{value}`"))?;
                options.name = Some(name.to_owned());
            }
            other => return Err(format!("unknown option `{other}`")),
        }
    }

    Ok(options)
}

/// Converts a slice of tokens into a Rust source string.
///
/// This function preserves token order and inserts spaces
/// between consecutive identifiers to avoid accidental
/// token merging (e.g. `foo bar` vs `foobar`).
pub(crate) fn tokens_to_string(tokens: &[TokenTree]) -> String {
    let mut out = String::new();
    let mut prev_was_ident = false;

    for t in tokens {
        let needs_space = prev_was_ident && matches!(t, TokenTree::Ident(_));

        if needs_space {
            out.push(' ');
        }

        out.push_str(&t.to_string());
        prev_was_ident = matches!(t, TokenTree::Ident(_));
    }

    out
}

/// Replaces the function body with one that runs the written body in a
/// fiber on a fresh I/O manager and stops the manager afterwards.
pub(crate) fn wrap_body(item: TokenStream, options: &Options) -> Result<Vec<TokenTree>, String> {
    let mut tokens: Vec<TokenTree> = item.into_iter().collect();

    let Some(pos) = tokens
        .iter()
        .rposition(|t| matches!(t, TokenTree::Group(g) if g.delimiter() == Delimiter::Brace))
    else {
        return Err(String::from("expected a function with a body"));
    };

    let block = match &tokens[pos] {
        TokenTree::Group(g) => g.stream().to_string(),
        _ => unreachable!(),
    };

    let new_block = format!(
        "{{
            let __weft_iom = {}
                .build()
                .expect(\"failed to start the weft runtime\");
            let __weft_out = __weft_iom.block_on(move || {{ {} }});
            __weft_iom.stop();
            __weft_out
        }}",
        options.builder(),
        block
    );

    let stream = new_block
        .parse::<TokenStream>()
        .map_err(|err| format!("failed to rebuild the function body: {err}"))?;
    tokens[pos] = TokenTree::Group(Group::new(Delimiter::Brace, stream));

    Ok(tokens)
}

/// Emits `compile_error!` with `message`.
pub(crate) fn compile_error(message: &str) -> TokenStream {
    format!("compile_error!({message:?});")
        .parse()
        .unwrap_or_default()
}
