//! Service and user principal name handling.

use crate::util::SecretString;

/// Rewrite an RFC-2078 `service@hostname` name to the `service/hostname`
/// SPN form the security package expects. Only the first `@` is rewritten,
/// and only when the name contains no `/` (so `service/host@REALM` passes
/// through unchanged).
pub(crate) fn normalize_spn(service: &str) -> String {
    if service.contains('/') {
        service.to_string()
    } else {
        service.replacen('@', "/", 1)
    }
}

/// Split a `user:password` principal on the first `:`, percent-decoding
/// both halves. A principal without `:` is a user with no password.
pub(crate) fn split_principal(principal: &str) -> (String, Option<SecretString>) {
    match principal.split_once(':') {
        Some((user, password)) => (
            percent_decode(user),
            Some(SecretString::from(percent_decode(password))),
        ),
        None => (percent_decode(principal), None),
    }
}

/// Decode `%XX` escapes. Invalid escapes are kept literally; decoded bytes
/// that do not form UTF-8 are lossily replaced.
pub(crate) fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    match String::from_utf8(out) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spn_at_becomes_slash() {
        assert_eq!(normalize_spn("mongodb@server.example.com"), "mongodb/server.example.com");
    }

    #[test]
    fn spn_with_slash_unchanged() {
        assert_eq!(
            normalize_spn("mongodb/server.example.com@EXAMPLE.COM"),
            "mongodb/server.example.com@EXAMPLE.COM"
        );
        assert_eq!(normalize_spn("mongodb/server"), "mongodb/server");
    }

    #[test]
    fn spn_without_at_unchanged() {
        assert_eq!(normalize_spn("mongodb"), "mongodb");
    }

    #[test]
    fn principal_splits_on_first_colon() {
        let (user, password) = split_principal("alice:pa:ss");
        assert_eq!(user, "alice");
        assert_eq!(password.as_deref(), Some("pa:ss"));
    }

    #[test]
    fn principal_without_colon_has_no_password() {
        let (user, password) = split_principal("alice@EXAMPLE.COM");
        assert_eq!(user, "alice@EXAMPLE.COM");
        assert!(password.is_none());
    }

    #[test]
    fn principal_halves_are_percent_decoded() {
        let (user, password) = split_principal("a%40b%3Ac:p%25w");
        assert_eq!(user, "a@b:c");
        assert_eq!(password.as_deref(), Some("p%w"));
    }

    #[test]
    fn percent_decode_keeps_invalid_escapes() {
        assert_eq!(percent_decode("100%zz%4"), "100%zz%4");
        assert_eq!(percent_decode("%"), "%");
    }

    #[test]
    fn percent_decode_mixed_case_hex() {
        assert_eq!(percent_decode("%2f%2F"), "//");
    }
}
