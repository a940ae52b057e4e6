//! Claim decoding and expiry checks
//!
//! The credential manager never verifies credentials; it only needs to know
//! when an access credential expires. Decoding is therefore a pluggable
//! collaborator behind [`ClaimDecoder`], with [`JwtDecoder`] provided for
//! the common case of a compact-serialized JWT.
//!
//! **WARNING:** *Claims decoded here are untrusted.* They are suitable for
//! scheduling renewals, not for authorization decisions.

use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tabauth_clock::{DurationSecs, UnixTime};

use crate::error::{self, InvalidExpiryClaim, MalformedCredential};

/// The decoded, untrusted contents of an access credential
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClaimSet {
    header: Map<String, Value>,
    payload: Payload,
    signature: String,
}

/// The payload section of a claim set
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl ClaimSet {
    /// Assembles a claim set from its parts
    pub fn new(header: Map<String, Value>, payload: Payload, signature: impl Into<String>) -> Self {
        Self {
            header,
            payload,
            signature: signature.into(),
        }
    }

    /// The header fields
    pub fn header(&self) -> &Map<String, Value> {
        &self.header
    }

    /// The payload fields
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The opaque trailing segment, usually a signature
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The `exp` claim in seconds since the Unix epoch, if it is numeric
    pub fn expiry(&self) -> Option<i64> {
        self.payload.expiry()
    }

    /// Whether this claim set has expired as of `now`, allowing `skew`
    pub fn is_expired_at(
        &self,
        skew: DurationSecs,
        now: UnixTime,
    ) -> Result<bool, InvalidExpiryClaim> {
        is_expired(self.expiry(), skew, now)
    }
}

impl Payload {
    /// Constructs a payload with the given expiry and no other claims
    pub fn with_expiry(exp: i64) -> Self {
        Self {
            exp: Some(Value::from(exp)),
            extra: Map::new(),
        }
    }

    /// Adds a claim to the payload
    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// The `exp` claim, if present and numeric
    ///
    /// Fractional timestamps are truncated to whole seconds.
    pub fn expiry(&self) -> Option<i64> {
        let exp = self.exp.as_ref()?;
        exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))
    }

    /// Looks up any claim other than `exp`
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }
}

/// Determines whether an expiry timestamp has passed
///
/// `skew` is a tolerance subtracted from `now`, so a credential is still
/// considered live for `skew` seconds past its nominal expiry.
///
/// # Errors
///
/// Fails if `exp` is absent or not a positive timestamp.
pub fn is_expired(
    exp: Option<i64>,
    skew: DurationSecs,
    now: UnixTime,
) -> Result<bool, InvalidExpiryClaim> {
    match exp {
        Some(exp) if exp > 0 => Ok((exp as u64) < (now - skew).0),
        _ => Err(error::invalid_expiry_claim()),
    }
}

/// A decoder that turns a raw credential into a claim set
pub trait ClaimDecoder: Send + Sync {
    /// Decodes the raw credential
    fn decode(&self, raw: &str) -> Result<ClaimSet, MalformedCredential>;
}

/// Decodes compact-serialized JWTs without verifying their signatures
#[derive(Clone, Copy, Debug, Default)]
pub struct JwtDecoder;

impl ClaimDecoder for JwtDecoder {
    fn decode(&self, raw: &str) -> Result<ClaimSet, MalformedCredential> {
        let mut parts = raw.split('.');
        let (h_str, p_str, s_str) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s), None) => (h, p, s),
            _ => return Err(error::malformed_credential("expected three segments")),
        };

        let header =
            decode_segment(h_str, "header is not base64url", "header is not a JSON object")?;
        let payload =
            decode_segment(p_str, "payload is not base64url", "payload is not a JSON object")?;

        Ok(ClaimSet {
            header,
            payload,
            signature: s_str.to_owned(),
        })
    }
}

fn decode_segment<T>(
    segment: &str,
    not_base64: &'static str,
    not_json: &'static str,
) -> Result<T, MalformedCredential>
where
    T: for<'de> Deserialize<'de>,
{
    let raw = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| error::malformed_credential_with(not_base64, e))?;
    serde_json::from_slice(&raw).map_err(|e| error::malformed_credential_with(not_json, e))
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;
    use crate::test_util::unsigned_jwt;

    #[test]
    fn decodes_header_payload_and_signature() -> Result<()> {
        let raw = unsigned_jwt(1_700_000_000);
        let claims = JwtDecoder.decode(&raw)?;

        assert_eq!(claims.header().get("alg"), Some(&Value::from("none")));
        assert_eq!(claims.expiry(), Some(1_700_000_000));
        assert_eq!(claims.payload().claim("sub"), Some(&Value::from("tester")));
        assert_eq!(claims.signature(), "sig");
        Ok(())
    }

    #[test]
    fn rejects_wrong_segment_count() {
        let err = JwtDecoder.decode("only.two").unwrap_err();
        assert_eq!(err.reason(), "expected three segments");

        let err = JwtDecoder.decode("a.b.c.d").unwrap_err();
        assert_eq!(err.reason(), "expected three segments");
    }

    #[test]
    fn rejects_non_json_payload() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(b"not json");
        let err = JwtDecoder
            .decode(&format!("{}.{}.sig", header, payload))
            .unwrap_err();
        assert_eq!(err.reason(), "payload is not a JSON object");
    }

    #[test]
    fn rejects_bad_base64_header() {
        let err = JwtDecoder.decode("!!!.e30.sig").unwrap_err();
        assert_eq!(err.reason(), "header is not base64url");
    }

    #[test]
    fn missing_expiry_decodes_but_is_invalid() -> Result<()> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#);
        let claims = JwtDecoder.decode(&format!("{}.{}.", header, payload))?;

        assert_eq!(claims.expiry(), None);
        assert!(claims.is_expired_at(DurationSecs(0), UnixTime(10)).is_err());
        Ok(())
    }

    #[test]
    fn expiry_honours_skew() {
        let now = UnixTime(1_000);

        assert_eq!(is_expired(Some(1_001), DurationSecs(0), now), Ok(false));
        assert_eq!(is_expired(Some(999), DurationSecs(0), now), Ok(true));
        assert_eq!(is_expired(Some(990), DurationSecs(15), now), Ok(false));
        assert_eq!(is_expired(Some(984), DurationSecs(15), now), Ok(true));
    }

    #[test]
    fn non_positive_expiry_is_invalid() {
        let now = UnixTime(1_000);

        assert!(is_expired(Some(0), DurationSecs(0), now).is_err());
        assert!(is_expired(Some(-5), DurationSecs(0), now).is_err());
        assert!(is_expired(None, DurationSecs(0), now).is_err());
    }

    #[test]
    fn fractional_expiry_truncates() {
        let payload: Payload = serde_json::from_str(r#"{"exp": 1234.9}"#).unwrap();
        assert_eq!(payload.expiry(), Some(1234));
    }
}
