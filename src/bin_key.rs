// bin_key.rs - Discrete signature identifying a sampling bin

use std::fmt;
use std::str::FromStr;

/// Identifier of a sampling bin: a short sequence of small non-negative
/// integers (e.g. core/well bond counts of a cluster configuration).
///
/// Ordering is lexicographic over the sequence, which is what `Vec`'s
/// derived `Ord` gives us. Keys are never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinKey(Box<[u32]>);

impl BinKey {
    pub fn new(values: impl Into<Vec<u32>>) -> Self {
        Self(values.into().into_boxed_slice())
    }

    pub fn values(&self) -> &[u32] {
        &self.0
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// Key restricted to its first `arity` components. Keys that are
    /// already short enough are returned unchanged.
    pub fn truncated(&self, arity: usize) -> Self {
        let n = arity.min(self.0.len());
        Self::new(&self.0[..n])
    }
}

impl From<&[u32]> for BinKey {
    fn from(values: &[u32]) -> Self {
        Self::new(values)
    }
}

impl<const N: usize> From<[u32; N]> for BinKey {
    fn from(values: [u32; N]) -> Self {
        Self::new(values.to_vec())
    }
}

/// Printed as `[a, b, c]`.
impl fmt::Display for BinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str("]")
    }
}

/// Reasons a bracketed key failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinKeyError {
    MissingBrackets,
    Empty,
    BadComponent(String),
}

impl fmt::Display for BinKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinKeyError::MissingBrackets => f.write_str("bin key must be enclosed in [ ]"),
            BinKeyError::Empty => f.write_str("bin key has no components"),
            BinKeyError::BadComponent(s) => write!(f, "invalid bin key component {s:?}"),
        }
    }
}

impl std::error::Error for BinKeyError {}

impl FromStr for BinKey {
    type Err = BinKeyError;

    /// Accepts `[1, 2]`, `[1,2]` and `[1 2]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or(BinKeyError::MissingBrackets)?;

        let values = inner
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|tok| !tok.is_empty())
            .map(|tok| {
                tok.parse::<u32>()
                    .map_err(|_| BinKeyError::BadComponent(tok.to_string()))
            })
            .collect::<Result<Vec<u32>, _>>()?;

        if values.is_empty() {
            return Err(BinKeyError::Empty);
        }
        Ok(Self::new(values))
    }
}
