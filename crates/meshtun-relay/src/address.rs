//! Relay address parsing and normalization.
//!
//! Accepted forms are `host:port`, `tcp://host:port` and
//! `relay://host:port`. Hosts are lower-cased so that differently written
//! forms of one relay map to a single link.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::AddressError;

const SCHEMES: [&str; 2] = ["tcp", "relay"];

/// A normalized relay endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayAddress {
    host: String,
    port: u16,
}

impl RelayAddress {
    /// Parse and normalize an address
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let with_scheme = match trimmed.split_once("://") {
            Some((scheme, _)) => {
                let scheme = scheme.to_ascii_lowercase();
                if !SCHEMES.contains(&scheme.as_str()) {
                    return Err(AddressError::UnsupportedScheme(scheme));
                }
                trimmed.to_string()
            }
            None => format!("tcp://{trimmed}"),
        };

        let url = Url::parse(&with_scheme).map_err(|e| match e {
            url::ParseError::InvalidPort => AddressError::InvalidPort(trimmed.to_string()),
            other => AddressError::Malformed(trimmed.to_string(), other.to_string()),
        })?;

        if !url.username().is_empty()
            || url.password().is_some()
            || url.query().is_some()
            || url.fragment().is_some()
            || !matches!(url.path(), "" | "/")
        {
            return Err(AddressError::Malformed(
                trimmed.to_string(),
                "only host and port are allowed".into(),
            ));
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_ascii_lowercase(),
            _ => {
                return Err(AddressError::Malformed(
                    trimmed.to_string(),
                    "missing host".into(),
                ));
            }
        };

        match url.port() {
            None => Err(AddressError::MissingPort(trimmed.to_string())),
            Some(0) => Err(AddressError::InvalidPort(trimmed.to_string())),
            Some(port) => Ok(Self { host, port }),
        }
    }

    /// Host name or IP literal (IPv6 in brackets)
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for connecting
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for RelayAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_accepted_forms_normalize_alike() {
        let expected = RelayAddress::parse("relay.example.com:443").unwrap();
        for input in [
            "relay.example.com:443",
            "  Relay.Example.COM:443 ",
            "tcp://relay.example.com:443",
            "TCP://relay.example.com:443/",
            "relay://RELAY.example.com:443",
        ] {
            assert_eq!(RelayAddress::parse(input).unwrap(), expected, "{input}");
        }
        assert_eq!(expected.to_string(), "relay.example.com:443");
        assert_eq!(expected.port(), 443);
    }

    #[test]
    fn test_ip_literals() {
        let v4 = RelayAddress::parse("127.0.0.1:8443").unwrap();
        assert_eq!(v4.authority(), "127.0.0.1:8443");

        let v6 = RelayAddress::parse("[::1]:8443").unwrap();
        assert_eq!(v6.host(), "[::1]");
        assert_eq!(v6.authority(), "[::1]:8443");
    }

    #[test]
    fn test_rejections() {
        assert_eq!(RelayAddress::parse("   "), Err(AddressError::Empty));
        assert!(matches!(
            RelayAddress::parse("relay.example.com"),
            Err(AddressError::MissingPort(_))
        ));
        assert!(matches!(
            RelayAddress::parse("relay.example.com:0"),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            RelayAddress::parse("relay.example.com:70000"),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            RelayAddress::parse("https://relay.example.com:443"),
            Err(AddressError::UnsupportedScheme(s)) if s == "https"
        ));
        assert!(matches!(
            RelayAddress::parse("tcp://user@relay.example.com:443"),
            Err(AddressError::Malformed(..))
        ));
        assert!(matches!(
            RelayAddress::parse("tcp://relay.example.com:443/derp"),
            Err(AddressError::Malformed(..))
        ));
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(input in "\\PC{0,40}") {
            let _ = RelayAddress::parse(&input);
        }

        #[test]
        fn prop_normalization_is_idempotent(
            host in "[a-zA-Z][a-zA-Z0-9-]{0,15}(\\.[a-zA-Z]{2,6}){0,2}",
            port in 1u16..=u16::MAX,
        ) {
            let addr = RelayAddress::parse(&format!("{host}:{port}")).unwrap();
            prop_assert_eq!(RelayAddress::parse(&addr.to_string()).unwrap(), addr.clone());
            prop_assert_eq!(addr.host(), host.to_ascii_lowercase());

            let upper = RelayAddress::parse(&format!("relay://{}:{port}", host.to_ascii_uppercase())).unwrap();
            prop_assert_eq!(upper, addr);
        }
    }
}
