//! Pure string transforms that undo hoster obfuscation.
//!
//! None of these execute script. Each reproduces one known construction:
//! Dean Edwards' `eval(function(p,a,c,k,e,d)...)` packer (Mixdrop,
//! Sportsonline), and VOE's rot13/base64/shift payload chain.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;

/// Digits used by the packer's base-N word encoder.
const PACKER_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

static PACKER_ARGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\}\s*\(\s*'((?:[^'\\]|\\.)*)'\s*,\s*(\d+|\[\])\s*,\s*(\d+)\s*,\s*'((?:[^'\\]|\\.)*)'\.split\(\s*'\|'\s*\)"#,
    )
    .expect("valid regex")
});

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w+\b").expect("valid regex"));

/// Junk markers VOE interleaves into its payload before base64.
const VOE_JUNK: &[&str] = &["@$", "^^", "~@", "%?", "*~", "!!", "#&"];

/// `true` if `script` contains a packer invocation.
pub fn is_packed(script: &str) -> bool {
    script.contains("eval(function(p,a,c,k,e,")
}

/// Reverse the packer: every base-N word in the payload is replaced by the
/// keyword at that index (empty keywords keep the word itself).
pub fn unpack(script: &str) -> Option<String> {
    let caps = PACKER_ARGS.captures(script)?;
    let payload = unescape_js(caps.get(1)?.as_str());
    let radix = match caps.get(2)?.as_str() {
        "[]" => 62,
        digits => digits.parse().ok()?,
    };
    let keywords: Vec<&str> = caps.get(4)?.as_str().split('|').collect();
    if !(2..=62).contains(&radix) {
        return None;
    }

    let unpacked = WORD.replace_all(&payload, |word: &regex::Captures<'_>| {
        let token = &word[0];
        match decode_base_n(token, radix).and_then(|i| keywords.get(i)) {
            Some(keyword) if !keyword.is_empty() => (*keyword).to_string(),
            _ => token.to_string(),
        }
    });
    Some(unpacked.into_owned())
}

/// Unpack every packed block found in `html` and concatenate the results.
pub fn unpack_all(html: &str) -> Vec<String> {
    html.split("eval(function(p,a,c,k,e,")
        .skip(1)
        .filter_map(|chunk| unpack(&format!("eval(function(p,a,c,k,e,{chunk}")))
        .collect()
}

fn decode_base_n(word: &str, radix: u32) -> Option<usize> {
    let mut value: usize = 0;
    for byte in word.bytes() {
        let digit = PACKER_ALPHABET.iter().position(|&c| c == byte)?;
        if digit >= radix as usize {
            return None;
        }
        value = value.checked_mul(radix as usize)?.checked_add(digit)?;
    }
    Some(value)
}

fn unescape_js(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// ROT13 over ASCII letters.
pub fn rot13(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'a'..='z' => (((c as u8 - b'a') + 13) % 26 + b'a') as char,
            'A'..='Z' => (((c as u8 - b'A') + 13) % 26 + b'A') as char,
            _ => c,
        })
        .collect()
}

/// Decode base64 in any of the standard/url-safe, padded/unpadded forms.
pub fn decode_base64_any(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(text).ok())
}

/// Decode VOE's JSON-wrapped source payload:
/// rot13 → strip junk markers → base64 → shift code points by -3 →
/// reverse → base64 → JSON.
pub fn decode_voe_payload(encoded: &str) -> Option<serde_json::Value> {
    let mut stage = rot13(encoded);
    for junk in VOE_JUNK {
        stage = stage.replace(junk, "");
    }
    let first = String::from_utf8(decode_base64_any(&stage)?).ok()?;
    let shifted: String = first
        .chars()
        .map(|c| char::from_u32((c as u32).wrapping_sub(3)).unwrap_or(c))
        .collect();
    let reversed: String = shifted.chars().rev().collect();
    let second = decode_base64_any(&reversed)?;
    serde_json::from_slice(&second).ok()
}
