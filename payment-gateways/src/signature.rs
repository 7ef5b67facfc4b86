//! HMAC-SHA256 helpers shared by the webhook verifiers.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use sha2::Sha256;

use crate::gateway::{PaymentError, PaymentResult};

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &[u8]) -> PaymentResult<HmacSha256> {
    HmacSha256::new_from_slice(secret)
        .map_err(|_| PaymentError::InvalidSignature("unusable webhook secret".to_string()))
}

pub fn sign_hex(secret: &[u8], message: &[u8]) -> PaymentResult<String> {
    let mut mac = mac(secret)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison of a hex signature against the expected HMAC.
pub fn verify_hex(secret: &[u8], message: &[u8], signature_hex: &str) -> PaymentResult<()> {
    let expected = hex::decode(signature_hex.trim())
        .map_err(|_| PaymentError::InvalidSignature("signature is not hex".to_string()))?;
    let mut mac = mac(secret)?;
    mac.update(message);
    mac.verify_slice(&expected)
        .map_err(|_| PaymentError::InvalidSignature("signature mismatch".to_string()))
}

/// A `t=<unix>,v1=<hex>` style header. Several `v1` entries may be present during secret rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedSignature {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

pub fn parse_timestamped(header: &str, timestamp_key: &str) -> PaymentResult<TimestampedSignature> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        if key == timestamp_key {
            timestamp = value.parse::<i64>().ok();
        } else if key == "v1" {
            signatures.push(value.to_string());
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(TimestampedSignature {
            timestamp,
            signatures,
        }),
        _ => Err(PaymentError::InvalidSignature(
            "signature header missing timestamp or v1".to_string(),
        )),
    }
}

pub fn verify_any(secret: &[u8], message: &[u8], candidates: &[String]) -> PaymentResult<()> {
    if candidates
        .iter()
        .any(|candidate| verify_hex(secret, message, candidate).is_ok())
    {
        Ok(())
    } else {
        Err(PaymentError::InvalidSignature("signature mismatch".to_string()))
    }
}

pub fn check_tolerance(timestamp: i64, now: DateTime<Utc>, tolerance_secs: i64) -> PaymentResult<()> {
    if (now.timestamp() - timestamp).abs() > tolerance_secs {
        return Err(PaymentError::InvalidSignature(format!(
            "timestamp {} outside {}s tolerance",
            timestamp, tolerance_secs
        )));
    }
    Ok(())
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> PaymentResult<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| PaymentError::InvalidSignature(format!("missing {} header", name)))
}
