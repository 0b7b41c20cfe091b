//! Fuzz testing for the WAF filter.
//!
//! Checks that `WafFilter::inspect`:
//!
//! - Never panics on arbitrary paths, query strings and bodies
//! - Returns the same verdict when run twice on the same request
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_waf -- -max_total_time=60
//! ```

#![no_main]

use std::sync::LazyLock;

use arbitrary::Arbitrary;
use http::Method;
use libfuzzer_sys::fuzz_target;
use scholarship_gateway::waf::{WafConfig, WafFilter, WafRequest};

static FILTER: LazyLock<Option<WafFilter>> =
    LazyLock::new(|| WafFilter::new(WafConfig::default()).ok());

#[derive(Debug, Arbitrary)]
struct Input {
    method: u8,
    path: String,
    query: Option<String>,
    form_encoded: bool,
    body: Vec<u8>,
}

fn method(selector: u8) -> Method {
    match selector % 5 {
        0 => Method::GET,
        1 => Method::POST,
        2 => Method::PUT,
        3 => Method::PATCH,
        _ => Method::DELETE,
    }
}

fuzz_target!(|input: Input| {
    let Some(filter) = FILTER.as_ref() else {
        return;
    };

    let method = method(input.method);
    let request = WafRequest {
        method: &method,
        path: &input.path,
        query: input.query.as_deref(),
        content_type: input
            .form_encoded
            .then_some("application/x-www-form-urlencoded"),
        body: &input.body,
    };

    let first = filter.inspect(&request);
    let second = filter.inspect(&request);
    assert_eq!(first, second, "inspection must be deterministic");
});
