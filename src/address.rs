//! Payment address parsing.
//!
//! Two forms are recognised: lightning addresses (`name@domain.tld`) and
//! bech32 `lnurl1…` strings. Anything else means the recipient has no
//! resolvable address, and a payment flow ends before talking to the backend.

use crate::error::AddressError;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PaymentAddress {
    /// `name@domain`, lowercased.
    Lightning(String),
    /// bech32 `lnurl1…`, lowercased.
    Lnurl(String),
}

fn lightning_address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9._+\-]+@([a-z0-9](?:[a-z0-9\-]*[a-z0-9])?\.)+[a-z]{2,}$")
            .expect("lightning address regex")
    })
}

impl PaymentAddress {
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        let trimmed = trimmed
            .strip_prefix("lightning:")
            .or_else(|| trimmed.strip_prefix("LIGHTNING:"))
            .unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("lnurl1") {
            let (hrp, _) = bech32::decode(trimmed).map_err(|e| AddressError::Malformed(format!("lnurl: {e}")))?;
            if hrp.to_lowercase() != "lnurl" {
                return Err(AddressError::Malformed("lnurl: unexpected prefix".into()));
            }
            return Ok(PaymentAddress::Lnurl(lower));
        }
        if lightning_address_re().is_match(&lower) {
            return Ok(PaymentAddress::Lightning(lower));
        }
        Err(AddressError::Malformed(trimmed.chars().take(64).collect()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            PaymentAddress::Lightning(s) | PaymentAddress::Lnurl(s) => s,
        }
    }
}

impl fmt::Display for PaymentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lightning_addresses() {
        assert_eq!(
            PaymentAddress::parse(" Satoshi@Example.COM ").unwrap(),
            PaymentAddress::Lightning("satoshi@example.com".into())
        );
        assert_eq!(
            PaymentAddress::parse("lightning:zap.me@sub.domain.io").unwrap().as_str(),
            "zap.me@sub.domain.io"
        );
    }

    #[test]
    fn lnurl_bech32() {
        let encoded = bech32::encode::<bech32::Bech32>(
            bech32::Hrp::parse("lnurl").unwrap(),
            b"https://example.com/.well-known/lnurlp/alice",
        )
        .unwrap();
        assert!(matches!(PaymentAddress::parse(&encoded.to_uppercase()), Ok(PaymentAddress::Lnurl(_))));
        assert!(PaymentAddress::parse("lnurl1notbech32").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(PaymentAddress::parse("   ").unwrap_err(), AddressError::Empty);
        assert!(PaymentAddress::parse("npub1xyz").is_err());
        assert!(PaymentAddress::parse("alice@").is_err());
        assert!(PaymentAddress::parse("@example.com").is_err());
    }
}
