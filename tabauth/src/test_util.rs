use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::json;

/// Builds an unsigned JWT for the `tester` subject expiring at `exp`
pub fn unsigned_jwt(exp: i64) -> String {
    unsigned_jwt_for("tester", exp)
}

/// Builds an unsigned JWT for `sub` expiring at `exp`
pub fn unsigned_jwt_for(sub: &str, exp: i64) -> String {
    let header = json!({ "alg": "none", "typ": "JWT" });
    let payload = json!({ "exp": exp, "sub": sub });

    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string()),
    )
}

/// Builds an unsigned JWT with no `exp` claim
pub fn unsigned_jwt_without_expiry() -> String {
    let header = json!({ "alg": "none", "typ": "JWT" });
    let payload = json!({ "sub": "tester" });

    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string()),
    )
}
