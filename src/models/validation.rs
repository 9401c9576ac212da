use anyhow::{Result, anyhow};

pub const MIN_TOKEN_LENGTH: usize = 100;
pub const MAX_TOKEN_LENGTH: usize = 4096;

/// FCM registration tokens are `<instance id>:<payload>`.
const TOKEN_MARKER: char = ':';

pub fn validate_fcm_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(anyhow!("Device token cannot be empty"));
    }

    if token.len() < MIN_TOKEN_LENGTH {
        return Err(anyhow!(
            "Device token too short (minimum {} characters)",
            MIN_TOKEN_LENGTH
        ));
    }

    if token.len() > MAX_TOKEN_LENGTH {
        return Err(anyhow!(
            "Device token too long (maximum {} characters)",
            MAX_TOKEN_LENGTH
        ));
    }

    match token.find(TOKEN_MARKER) {
        Some(0) | None => return Err(anyhow!("Device token is missing its instance id prefix")),
        Some(pos) if pos == token.len() - 1 => {
            return Err(anyhow!("Device token has an empty payload"));
        }
        Some(_) => {}
    }

    let valid_chars = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':' || c == '.');

    if !valid_chars {
        return Err(anyhow!("Device token contains invalid characters"));
    }

    Ok(())
}

pub fn is_valid_fcm_token(token: &str) -> bool {
    validate_fcm_token(token).is_ok()
}
