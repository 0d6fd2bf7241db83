//! Upload metadata header and object addresses.
//!
//! # Header
//!
//! ```text
//! publickey=<stripped pem>,signature=<b64url>,user=<u>,group=<g>[,title=<%enc>][,url=<%enc>][,<extra>]
//! ```
//!
//! Field order is fixed; the server splits on `,`. Only `title` and `url`
//! are percent-encoded, everything else is passed through as-is.

use crate::crypto::CryptoData;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Bytes left unescaped in `title`/`url`: alphanumerics and `-._~/`.
const QUOTE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

pub const OBJECT_SUFFIX: &str = ".tar.zst";

/// Operator-supplied fields of the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFields {
    pub user: String,
    pub group: String,
    pub title: Option<String>,
    pub url: Option<String>,
    /// Appended verbatim after every other field.
    pub extra: Option<String>,
}

impl MetadataFields {
    pub fn new(user: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            group: group.into(),
            ..Default::default()
        }
    }
}

pub fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, QUOTE_SET).to_string()
}

/// Build the transfer metadata header. Unsigned uploads carry no
/// `publickey`/`signature` fields.
pub fn build_header(crypto: Option<&CryptoData>, fields: &MetadataFields) -> String {
    let mut parts = Vec::with_capacity(7);
    if let Some(crypto) = crypto {
        parts.push(format!("publickey={}", crypto.stripped_public_key()));
        parts.push(format!("signature={}", crypto.signature));
    }
    parts.push(format!("user={}", fields.user));
    parts.push(format!("group={}", fields.group));
    if let Some(title) = &fields.title {
        parts.push(format!("title={}", percent_encode(title)));
    }
    if let Some(url) = &fields.url {
        parts.push(format!("url={}", percent_encode(url)));
    }
    if let Some(extra) = fields.extra.as_deref().filter(|e| !e.is_empty()) {
        parts.push(extra.to_string());
    }
    parts.join(",")
}

/// Body of the credential-check request.
pub fn credential_payload(crypto: &CryptoData, fields: &MetadataFields) -> String {
    format!(
        "publickey={},user={},group={}",
        crypto.stripped_public_key(),
        fields.user,
        fields.group
    )
}

/// `<base>/<nonce>.tar.zst`
pub fn object_address(base: &str, nonce: &str) -> String {
    format!("{}/{nonce}{OBJECT_SUFFIX}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> CryptoData {
        CryptoData {
            public_key: "-----BEGIN PUBLIC KEY-----\nMFkw\nEwYH\n-----END PUBLIC KEY-----\n"
                .into(),
            signature: "MEUCIQ".into(),
            nonce: "abcdefghijk".into(),
        }
    }

    #[test]
    fn test_header_field_order() {
        let fields = MetadataFields {
            title: Some("FAKE TITLE".into()),
            url: Some("FAKE_ñ_URL".into()),
            extra: Some("ticket=42".into()),
            ..MetadataFields::new("me@example.com", "eng")
        };
        assert_eq!(
            build_header(Some(&crypto()), &fields),
            "publickey=MFkwEwYH,signature=MEUCIQ,user=me@example.com,group=eng,\
             title=FAKE%20TITLE,url=FAKE_%C3%B1_URL,ticket=42"
        );
    }

    #[test]
    fn test_unsigned_header_has_identity_only() {
        let fields = MetadataFields::new("me", "eng");
        assert_eq!(build_header(None, &fields), "user=me,group=eng");
    }

    #[test]
    fn test_url_keeps_slashes_but_escapes_separators() {
        assert_eq!(
            percent_encode("https://x.test/a?b=c,d"),
            "https%3A//x.test/a%3Fb%3Dc%2Cd"
        );
    }

    #[test]
    fn test_credential_payload() {
        let fields = MetadataFields::new("me", "eng");
        assert_eq!(
            credential_payload(&crypto(), &fields),
            "publickey=MFkwEwYH,user=me,group=eng"
        );
    }

    #[test]
    fn test_object_address_tolerates_trailing_slash() {
        assert_eq!(
            object_address("s3://bucket/", "n0nce"),
            "s3://bucket/n0nce.tar.zst"
        );
    }
}
