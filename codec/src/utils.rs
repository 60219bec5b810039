// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::DecodeError;

/// Generate a random client id, used when a CONNECT arrives with a zero
/// length client id and the server is configured to allow it.
#[must_use]
pub fn random_client_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(23)
        .map(char::from)
        .collect()
}

/// Validate a UTF-8 string against MQTT's disallowed code points (§4.1):
/// control characters `U+0000..=U+001F`, `U+007F..=U+009F`, and Unicode
/// noncharacters. Ill-formed UTF-8 is rejected by the caller before this
/// runs (the string already exists), so only code point ranges are checked
/// here.
pub fn validate_utf8_string(s: &str) -> Result<(), DecodeError> {
    for ch in s.chars() {
        let cp = ch as u32;
        if cp <= 0x001F || (0x007F..=0x009F).contains(&cp) {
            return Err(DecodeError::InvalidUtf8String);
        }
        if is_noncharacter(cp) {
            return Err(DecodeError::InvalidUtf8String);
        }
    }
    if s.len() > u16::MAX as usize {
        return Err(DecodeError::InvalidUtf8String);
    }
    Ok(())
}

fn is_noncharacter(cp: u32) -> bool {
    (0xFDD0..=0xFDEF).contains(&cp) || (cp & 0xFFFE) == 0xFFFE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ascii() {
        assert!(validate_utf8_string("hello world").is_ok());
    }

    #[test]
    fn rejects_control_characters() {
        assert!(validate_utf8_string("a\u{0001}b").is_err());
        assert!(validate_utf8_string("a\u{007F}b").is_err());
        assert!(validate_utf8_string("a\u{0090}b").is_err());
    }

    #[test]
    fn rejects_noncharacters() {
        assert!(validate_utf8_string("a\u{FFFF}b").is_err());
        assert!(validate_utf8_string("a\u{FDD0}b").is_err());
    }

    #[test]
    fn rejects_oversize_strings() {
        let s = "a".repeat(u16::MAX as usize + 1);
        assert!(validate_utf8_string(&s).is_err());
    }
}
