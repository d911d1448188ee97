// packages/subpath-agent/src/encoding/mod.rs
//! Percent-encoding primitives and proxy encoding detection
//!
//! - **probe**: Round-trip probe of the proxy's decoding behaviour
//!
//! The helpers here operate on single path components. Encoding matches
//! what a browser produces for a URI component; decoding peels exactly one
//! layer and never fails (malformed input is returned untouched).

pub mod probe;

pub use probe::{EncodingProbe, ProbeConfig, ProbeResult};

/// Encode one layer
pub fn encode_component(input: &str) -> String {
    urlencoding::encode(input).into_owned()
}

/// Encode `times` layers on top of `input`
pub fn encode_times(input: &str, times: u32) -> String {
    let mut current = input.to_string();
    for _ in 0..times {
        current = encode_component(&current);
    }
    current
}

/// Decode one layer, leaving the input unchanged if it is not valid UTF-8 once decoded
pub fn decode_component(input: &str) -> String {
    match urlencoding::decode(input) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => input.to_string(),
    }
}

/// Decode `times` layers
pub fn decode_times(input: &str, times: u32) -> String {
    let mut current = input.to_string();
    for _ in 0..times {
        current = decode_component(&current);
    }
    current
}

/// True if `input` contains at least one `%XX` escape
pub fn has_percent_encoding(input: &str) -> bool {
    input
        .as_bytes()
        .windows(3)
        .any(|w| w[0] == b'%' && w[1].is_ascii_hexdigit() && w[2].is_ascii_hexdigit())
}

/// True if `input` contains an encoded path separator (`%2F`, any case)
pub fn contains_encoded_slash(input: &str) -> bool {
    input
        .as_bytes()
        .windows(3)
        .any(|w| w[0] == b'%' && w[1] == b'2' && (w[2] == b'f' || w[2] == b'F'))
}
