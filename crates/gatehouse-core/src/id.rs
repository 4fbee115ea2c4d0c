//! Tenant and agent identifier validation.

/// Maximum length of a normalized agent id.
const AGENT_ID_MAX_LEN: usize = 64;

/// Check a tenant id against the pattern `^[a-z0-9][a-z0-9_-]{0,31}$`.
///
/// Tenant ids name filesystem subtrees and session-key segments, so the
/// character class is closed: lowercase alphanumerics plus `_` and `-`,
/// starting with an alphanumeric, at most 32 characters.
#[must_use]
pub fn is_valid_tenant_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.is_empty() || bytes.len() > 32 {
        return false;
    }
    let first_ok = bytes[0].is_ascii_lowercase() || bytes[0].is_ascii_digit();
    first_ok && bytes.iter().all(|&b| is_id_byte(b))
}

fn is_id_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-'
}

/// Normalize an agent id for use inside a session key.
///
/// Lowercases, collapses each run of invalid characters to a single `-`,
/// clips to 64 characters, and falls back to `main` when nothing survives.
#[must_use]
pub fn normalize_agent_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(AGENT_ID_MAX_LEN));
    let mut in_invalid_run = false;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            out.push(c);
            in_invalid_run = false;
        } else if !in_invalid_run {
            out.push('-');
            in_invalid_run = true;
        }
        if out.len() >= AGENT_ID_MAX_LEN {
            break;
        }
    }
    out.truncate(AGENT_ID_MAX_LEN);
    if out.is_empty() {
        "main".to_string()
    } else {
        out
    }
}
