//! Attribute macros for the `weft` fiber runtime.
//!
//! - `#[weft::main]` turns `main` into a blocking entry point that runs its
//!   body in a fiber.
//! - `#[weft::test]` does the same for a `#[test]` function.
//!
//! Both accept `threads = N` and `name = "..."`.

mod utils;

use proc_macro::TokenStream;

/// Runs the body of `main` in a fiber on a fresh `IoManager`.
///
/// ```rust,ignore
/// #[weft::main(threads = 4)]
/// fn main() {
///     weft::time::sleep(std::time::Duration::from_millis(10));
/// }
/// ```
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match utils::parse_options(attr) {
        Ok(options) => options,
        Err(msg) => return utils::compile_error(&msg),
    };

    match utils::wrap_body(item, &options) {
        Ok(tokens) => tokens.into_iter().collect(),
        Err(msg) => utils::compile_error(&msg),
    }
}

/// Runs a test body in a fiber on a fresh `IoManager`, one worker thread
/// unless `threads` says otherwise.
///
/// The manager is stopped once the body returns, so the test only finishes
/// after every timer and I/O registration it left behind has completed.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut options = match utils::parse_options(attr) {
        Ok(options) => options,
        Err(msg) => return utils::compile_error(&msg),
    };
    options.threads.get_or_insert(1);

    let tokens = match utils::wrap_body(item, &options) {
        Ok(tokens) => tokens,
        Err(msg) => return utils::compile_error(&msg),
    };

    let mut result: Vec<_> = "#[test]"
        .parse::<TokenStream>()
        .unwrap_or_default()
        .into_iter()
        .collect();
    result.extend(tokens);

    result.into_iter().collect()
}
