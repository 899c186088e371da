//! Trading Pair Model
//!
//! A trading pair is an ordered `BASE/QUOTE` symbol. Quantities are
//! denominated in the base asset, prices in quote per base unit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An ordered `BASE/QUOTE` trading pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TradingPair {
    base: String,
    quote: String,
}

impl TradingPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// Base asset symbol (the traded quantity unit)
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Quote asset symbol (the pricing unit)
    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Canonical `BASE/QUOTE` symbol string
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid trading pair symbol: {0}")]
pub struct InvalidPair(String);

impl FromStr for TradingPair {
    type Err = InvalidPair;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() => {
                Ok(Self::new(base.trim(), quote.trim()))
            }
            _ => Err(InvalidPair(s.to_string())),
        }
    }
}

impl TryFrom<String> for TradingPair {
    type Error = InvalidPair;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TradingPair> for String {
    fn from(pair: TradingPair) -> Self {
        pair.symbol()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        let pair: TradingPair = "CC/CBTC".parse().unwrap();
        assert_eq!(pair.base(), "CC");
        assert_eq!(pair.quote(), "CBTC");
        assert_eq!(pair.symbol(), "CC/CBTC");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("CCCBTC".parse::<TradingPair>().is_err());
        assert!("/CBTC".parse::<TradingPair>().is_err());
        assert!("CC/".parse::<TradingPair>().is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let pair: TradingPair = "CC/CBTC".parse().unwrap();
        let json = serde_json::to_string(&pair).unwrap();
        assert_eq!(json, "\"CC/CBTC\"");
        let back: TradingPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pair);
    }
}
