//! Token ring arithmetic
//!
//! A partitioner maps keys onto a ring of integer tokens bounded by
//! `[min, max]`. The Random scheme's bounds exceed 64 bits, so every token
//! is a [`BigInt`].
//!
//! Range construction divides the ring into N contiguous spans of width
//! `(max - min) / N`; the last span absorbs the remainder and closes at `max`.
//! A span covers the tokens `(start, end]`.

use crate::error::ConfigError;
use num_bigint::BigInt;
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;
use twox_hash::XxHash64;

/// Hashing scheme that maps keys to ring tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioner {
    /// 64-bit signed tokens in `[-(2^63) + 1, 2^63 - 1]`
    Murmur3,
    /// 127-bit unsigned tokens in `[0, 2^127]`
    Random,
}

impl Partitioner {
    /// Ring bounds for this scheme
    pub fn bounds(&self) -> TokenBounds {
        match self {
            Partitioner::Murmur3 => TokenBounds {
                min: BigInt::from(i64::MIN) + 1u32,
                max: BigInt::from(i64::MAX),
            },
            Partitioner::Random => TokenBounds {
                min: BigInt::from(0),
                max: BigInt::from(1u8) << 127,
            },
        }
    }

    /// Token for a key under this scheme
    pub fn token_for_key(&self, key: &str) -> BigInt {
        match self {
            Partitioner::Murmur3 => {
                let token = hash_with_seed(key, 0) as i64;
                if token == i64::MIN {
                    // i64::MIN is outside the ring
                    BigInt::from(i64::MIN) + 1u32
                } else {
                    BigInt::from(token)
                }
            }
            Partitioner::Random => {
                let high = hash_with_seed(key, 0) as u128;
                let low = hash_with_seed(key, 1) as u128;
                BigInt::from(((high << 64) | low) >> 1)
            }
        }
    }

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            Partitioner::Murmur3 => "Murmur3Partitioner",
            Partitioner::Random => "RandomPartitioner",
        }
    }
}

impl FromStr for Partitioner {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept fully-qualified class names as well as short forms
        let short = s.rsplit('.').next().unwrap_or(s).to_ascii_lowercase();
        match short.as_str() {
            "murmur3partitioner" | "murmur3" => Ok(Partitioner::Murmur3),
            "randompartitioner" | "random" => Ok(Partitioner::Random),
            _ => Err(ConfigError::UnknownPartitioner(s.to_string())),
        }
    }
}

impl fmt::Display for Partitioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn hash_with_seed(key: &str, seed: u64) -> u64 {
    let mut hasher = XxHash64::with_seed(seed);
    hasher.write(key.as_bytes());
    hasher.finish()
}

/// Inclusive token bounds of a ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBounds {
    pub min: BigInt,
    pub max: BigInt,
}

/// One contiguous span of the ring covering `(start, end]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSpan {
    pub start: BigInt,
    pub end: BigInt,
}

impl TokenBounds {
    /// Create explicit bounds (used for test rings and custom deployments)
    pub fn new(min: BigInt, max: BigInt) -> Result<Self, ConfigError> {
        if min >= max {
            return Err(ConfigError::InvalidBounds {
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(Self { min, max })
    }

    /// Width of the ring (`max - min`)
    pub fn width(&self) -> BigInt {
        &self.max - &self.min
    }

    /// Divide the ring into `count` contiguous spans
    pub fn split(&self, count: usize) -> Result<Vec<TokenSpan>, ConfigError> {
        let width = self.width();
        if count == 0 || BigInt::from(count) > width {
            return Err(ConfigError::InvalidRangeCount { count });
        }

        let interval = &width / BigInt::from(count);
        let mut spans = Vec::with_capacity(count);
        let mut start = self.min.clone();

        for i in 0..count {
            let end = if i + 1 == count {
                self.max.clone()
            } else {
                &start + &interval
            };
            spans.push(TokenSpan {
                start: start.clone(),
                end: end.clone(),
            });
            start = end;
        }

        Ok(spans)
    }

    /// Check whether a token lies on the ring
    pub fn contains(&self, token: &BigInt) -> bool {
        token >= &self.min && token <= &self.max
    }

    /// Fixed-width decimal encoding whose lexicographic order matches token order
    pub fn encode(&self, token: &BigInt) -> String {
        let digits = self.width().to_string().len();
        let offset = token - &self.min;
        format!("{:0>width$}", offset.to_string(), width = digits)
    }
}

/// Parse a token given as a decimal string
pub fn parse_token(s: &str) -> Result<BigInt, ConfigError> {
    BigInt::from_str(s.trim()).map_err(|_| ConfigError::InvalidToken(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(bounds: &TokenBounds, spans: &[TokenSpan]) {
        assert_eq!(spans.first().unwrap().start, bounds.min);
        assert_eq!(spans.last().unwrap().end, bounds.max);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        for span in spans {
            assert!(span.start < span.end);
        }
    }

    #[test]
    fn test_murmur3_bounds() {
        let bounds = Partitioner::Murmur3.bounds();
        assert_eq!(bounds.min.to_string(), "-9223372036854775807");
        assert_eq!(bounds.max.to_string(), "9223372036854775807");
    }

    #[test]
    fn test_random_bounds() {
        let bounds = Partitioner::Random.bounds();
        assert_eq!(bounds.min, BigInt::from(0));
        assert_eq!(
            bounds.max.to_string(),
            "170141183460469231731687303715884105728"
        );
    }

    #[test]
    fn test_partitioner_from_str() {
        assert_eq!("Murmur3Partitioner".parse::<Partitioner>().unwrap(), Partitioner::Murmur3);
        assert_eq!(
            "org.apache.cassandra.dht.RandomPartitioner"
                .parse::<Partitioner>()
                .unwrap(),
            Partitioner::Random
        );
        assert!(matches!(
            "ByteOrderedPartitioner".parse::<Partitioner>(),
            Err(ConfigError::UnknownPartitioner(_))
        ));
    }

    #[test]
    fn test_split_small_ring() {
        let bounds = TokenBounds::new(BigInt::from(-100), BigInt::from(100)).unwrap();
        let spans = bounds.split(4).unwrap();
        let ends: Vec<String> = spans.iter().map(|s| s.end.to_string()).collect();
        assert_eq!(ends, vec!["-50", "0", "50", "100"]);
        assert_partition(&bounds, &spans);
    }

    #[test]
    fn test_split_last_absorbs_remainder() {
        let bounds = TokenBounds::new(BigInt::from(0), BigInt::from(10)).unwrap();
        let spans = bounds.split(3).unwrap();
        assert_eq!(spans[0].end, BigInt::from(3));
        assert_eq!(spans[1].end, BigInt::from(6));
        assert_eq!(spans[2].start, BigInt::from(6));
        assert_eq!(spans[2].end, BigInt::from(10));
    }

    #[test]
    fn test_split_both_schemes() {
        for partitioner in [Partitioner::Murmur3, Partitioner::Random] {
            let bounds = partitioner.bounds();
            for count in [1, 2, 7, 256, 1000] {
                let spans = bounds.split(count).unwrap();
                assert_eq!(spans.len(), count);
                assert_partition(&bounds, &spans);
            }
        }
    }

    #[test]
    fn test_split_invalid_count() {
        let bounds = TokenBounds::new(BigInt::from(0), BigInt::from(3)).unwrap();
        assert!(bounds.split(0).is_err());
        assert!(bounds.split(4).is_err());
        assert!(TokenBounds::new(BigInt::from(5), BigInt::from(5)).is_err());
    }

    #[test]
    fn test_token_for_key_in_bounds() {
        for partitioner in [Partitioner::Murmur3, Partitioner::Random] {
            let bounds = partitioner.bounds();
            for i in 0..200 {
                let token = partitioner.token_for_key(&format!("key-{}", i));
                assert!(bounds.contains(&token));
            }
        }
    }

    #[test]
    fn test_encode_preserves_order() {
        let bounds = Partitioner::Murmur3.bounds();
        let low = bounds.encode(&BigInt::from(-5));
        let high = bounds.encode(&BigInt::from(3));
        assert_eq!(low.len(), high.len());
        assert!(low < high);
        assert_eq!(bounds.encode(&bounds.min), "0".repeat(low.len()));
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token(" -42 ").unwrap(), BigInt::from(-42));
        assert!(matches!(parse_token("abc"), Err(ConfigError::InvalidToken(_))));
    }
}
