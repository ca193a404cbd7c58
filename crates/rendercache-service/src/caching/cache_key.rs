use std::fmt;
use std::sync::Arc;

/// The separator between the length prefix and the contents of a token.
const LENGTH_SEPARATOR: char = ':';

/// Encodes a sequence of tokens into a single string.
///
/// Every token is written as its length in bytes, a `:`, and the raw token, e.g.
/// `["ab", "c"]` becomes `2:ab1:c`. Because the length is known before the contents, the token
/// boundaries can always be recovered, no matter what the tokens contain.
pub fn encode_tokens<I>(tokens: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut builder = CacheKeyBuilder::default();
    for token in tokens {
        builder.push(token.as_ref());
    }
    builder.encoded
}

/// Splits a string produced by [`encode_tokens`] back into its tokens.
///
/// Returns `None` if `encoded` is not a valid encoding.
pub fn decode_tokens(encoded: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut rest = encoded;

    while !rest.is_empty() {
        let (len, tail) = rest.split_once(LENGTH_SEPARATOR)?;
        if len.is_empty() || !len.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // lengths are written without leading zeros
        if len.len() > 1 && len.starts_with('0') {
            return None;
        }
        let len: usize = len.parse().ok()?;
        let token = tail.get(..len)?;
        tokens.push(token.to_owned());
        rest = &tail[len..];
    }

    Some(tokens)
}

/// The key of an outcome in the [`ResultCache`](super::ResultCache).
///
/// A key is the encoded form of a sequence of tokens, as produced by [`encode_tokens`]. Two keys
/// are equal exactly when their token sequences are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates a [`CacheKey`] from the given tokens.
    pub fn from_tokens<I>(tokens: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self(encode_tokens(tokens).into())
    }

    /// Creates a [`CacheKey`] from an already encoded string.
    ///
    /// Returns `None` if `encoded` is not a valid encoding.
    pub fn from_encoded(encoded: &str) -> Option<Self> {
        decode_tokens(encoded).map(|_| Self(encoded.into()))
    }

    /// Returns the encoded form of this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the tokens this key was created from.
    pub fn tokens(&self) -> Vec<String> {
        // keys can only be constructed from valid encodings
        decode_tokens(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A builder for [`CacheKey`]s.
///
/// Tokens are appended one by one, which avoids collecting them up front.
#[derive(Debug, Default, Clone)]
pub struct CacheKeyBuilder {
    encoded: String,
}

impl CacheKeyBuilder {
    /// Appends one token to the key.
    pub fn push(&mut self, token: &str) -> &mut Self {
        use std::fmt::Write;
        // writing into a `String` never fails
        let _ = write!(self.encoded, "{}{LENGTH_SEPARATOR}", token.len());
        self.encoded.push_str(token);
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        CacheKey(self.encoded.into())
    }
}
