use std::fmt;

use serde::Serialize;

use crate::GatewayError;

/// Digits after the country prefix.
pub const SUBSCRIBER_DIGITS: usize = 9;

/// A payer phone number in international form (`254712345678`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Accepts local (`0712345678`), bare (`712345678`) or international
    /// (`254712345678`) input; separators and `+` are ignored.
    pub fn parse(raw: &str, country_prefix: &str) -> Result<Self, GatewayError> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

        let normalized = if let Some(rest) = digits.strip_prefix('0') {
            format!("{country_prefix}{rest}")
        } else if digits.starts_with(country_prefix) {
            digits
        } else {
            format!("{country_prefix}{digits}")
        };

        if normalized.len() == country_prefix.len() + SUBSCRIBER_DIGITS
            && normalized.starts_with(country_prefix)
        {
            Ok(Self(normalized))
        } else {
            Err(GatewayError::InvalidPhoneNumber(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<String, GatewayError> {
        PhoneNumber::parse(raw, "254").map(|p| p.as_str().to_string())
    }

    #[test]
    fn local_format_gets_country_prefix() {
        assert_eq!(parse("0712345678").unwrap(), "254712345678");
    }

    #[test]
    fn bare_subscriber_number_gets_country_prefix() {
        assert_eq!(parse("712345678").unwrap(), "254712345678");
    }

    #[test]
    fn international_format_is_unchanged() {
        assert_eq!(parse("254712345678").unwrap(), "254712345678");
        assert_eq!(parse("+254 712-345-678").unwrap(), "254712345678");
    }

    #[test]
    fn short_numbers_are_rejected() {
        assert!(matches!(parse("12345"), Err(GatewayError::InvalidPhoneNumber(raw)) if raw == "12345"));
        assert!(parse("").is_err());
        assert!(parse("07123456789").is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn every_accepted_form_normalizes_to_the_same_number(subscriber in "[17][0-9]{8}") {
                let expected = format!("254{subscriber}");
                prop_assert_eq!(parse(&format!("0{subscriber}")).unwrap(), expected.clone());
                prop_assert_eq!(parse(&subscriber).unwrap(), expected.clone());
                prop_assert_eq!(parse(&expected).unwrap(), expected);
            }

            #[test]
            fn accepted_numbers_are_twelve_digits(raw in "\\PC{0,20}") {
                if let Ok(number) = PhoneNumber::parse(&raw, "254") {
                    prop_assert_eq!(number.as_str().len(), 12);
                    prop_assert!(number.as_str().starts_with("254"));
                    prop_assert!(number.as_str().chars().all(|c| c.is_ascii_digit()));
                }
            }
        }
    }
}
