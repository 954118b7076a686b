//! Helpers for turning request metadata into dimension keys.

/// Key used when no client address can be determined.
///
/// Every client without network metadata shares this one bucket, so one of
/// them tripping a lockout locks out the rest.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Resolve the client address from request headers.
///
/// Prefers the first `x-forwarded-for` hop, then `x-real-ip`, then falls
/// back to [`UNKNOWN_ADDRESS`]. `header` is a case-insensitive lookup
/// supplied by the caller's HTTP layer.
pub fn client_address<'a, F>(header: F) -> String
where
    F: Fn(&str) -> Option<&'a str>,
{
    if let Some(forwarded) = header("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next().map(str::trim) {
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = header("x-real-ip").map(str::trim) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    UNKNOWN_ADDRESS.to_string()
}

/// Normalize a logical identifier such as an email address.
///
/// Blank input means the identifier is unknown.
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}
