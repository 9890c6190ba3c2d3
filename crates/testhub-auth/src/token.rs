//! Reading the expiry claim out of JWT bearer tokens.
//!
//! The signature is not verified; the server does that. The claim is only
//! used to schedule refreshes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Expiry of `token` in milliseconds since the epoch, if it is a JWT with an
/// `exp` claim.
pub fn expiry_millis(token: &str) -> Option<i64> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    claims.exp.and_then(|exp| exp.checked_mul(1000))
}
