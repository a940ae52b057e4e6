//! Strongly typed strings for credentials and names
//!
//! Credentials stay out of logs by default: `{:?}` and `{}` print a
//! placeholder. `{:#?}` prints a short quoted prefix, whose length can be
//! overridden with a width (`{:#8?}`), and `{:#}` prints the whole value.

use std::fmt;

use aliri_braid::braid;

macro_rules! redacted {
    ($ty:ty: $label:literal, $prefix_len:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if !f.alternate() {
                    return f.write_str(concat!("***", $label, "***"));
                }

                let len = f.width().unwrap_or($prefix_len);
                write!(f, "\"{}\"", Prefix(self.as_str(), len))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str(self.as_str())
                } else {
                    f.write_str(concat!("***", $label, "***"))
                }
            }
        }
    };
}

/// At most `len` characters of a secret, the last replaced by an ellipsis
/// when anything was cut
struct Prefix<'a>(&'a str, usize);

impl fmt::Display for Prefix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Prefix(value, len) = *self;
        if len <= 1 {
            return f.write_str("…");
        }

        match value.char_indices().nth(len - 1) {
            Some((cut, _)) => {
                f.write_str(&value[..cut])?;
                f.write_str("…")
            }
            None => f.write_str(value),
        }
    }
}

/// An OAuth2 client ID
#[braid(serde)]
pub struct ClientId;

/// An access credential, as held in shared storage
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef: "ACCESS TOKEN", 15);

/// A renewal credential, exchanged for a new access credential on refresh
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

redacted!(RefreshTokenRef: "REFRESH TOKEN", 5);

/// The name of a storage-backed lock
#[braid]
pub struct LockName;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_hidden_by_default() {
        let token = RefreshToken::from_static("very-secret-value");
        assert_eq!(format!("{:?}", &*token), "***REFRESH TOKEN***");
        assert_eq!(format!("{}", &*token), "***REFRESH TOKEN***");
    }

    #[test]
    fn alternate_debug_reveals_a_prefix() {
        let token = AccessToken::from_static("eyJhbGciOiJIUzI1NiJ9.payload.sig");
        assert_eq!(format!("{:#?}", &*token), "\"eyJhbGciOiJIUz…\"");
        assert_eq!(format!("{:#6?}", &*token), "\"eyJhb…\"");
    }

    #[test]
    fn alternate_display_reveals_everything() {
        let token = AccessToken::from_static("abc.def.ghi");
        assert_eq!(format!("{:#}", &*token), "abc.def.ghi");
    }

    #[test]
    fn short_secrets_are_not_cut() {
        let token = RefreshToken::from_static("abcd");
        assert_eq!(format!("{:#?}", &*token), "\"abcd\"");

        let token = RefreshToken::from_static("abcde");
        assert_eq!(format!("{:#?}", &*token), "\"abcd…\"");
        assert_eq!(format!("{:#1?}", &*token), "\"…\"");
    }
}
