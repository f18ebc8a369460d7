//! Validation helpers for DTOs.

use validator::ValidationError;

/// Longest beat or media URL accepted from clients.
const MAX_URL_LEN: usize = 2048;

/// Validates that a beat URL is an absolute `http(s)` URL of reasonable length.
///
/// # Examples
///
/// ```ignore
/// validate_beat_url("https://cdn.example.com/beat.mp3") // Ok
/// validate_beat_url("ftp://cdn.example.com/beat.mp3")   // Err - scheme
/// validate_beat_url("")                                 // Err - empty
/// ```
pub fn validate_beat_url(url: &str) -> Result<(), ValidationError> {
    if url.is_empty() || url.len() > MAX_URL_LEN {
        let mut err = ValidationError::new("beat_url_length");
        err.message = Some(
            format!("Beat URL must be between 1 and {MAX_URL_LEN} characters (got {})", url.len())
                .into(),
        );
        return Err(err);
    }

    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    if !rest.is_some_and(|host| !host.is_empty() && !host.contains(char::is_whitespace)) {
        let mut err = ValidationError::new("beat_url_format");
        err.message = Some("Beat URL must be an absolute http(s) URL without spaces".into());
        return Err(err);
    }

    Ok(())
}

/// Validates that a text field is not only whitespace.
pub fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some("Value must not be blank".into());
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_beat_url_valid() {
        assert!(validate_beat_url("https://cdn.example.com/beat.mp3").is_ok());
        assert!(validate_beat_url("http://localhost:8080/b").is_ok());
    }

    #[test]
    fn test_validate_beat_url_invalid() {
        assert!(validate_beat_url("").is_err());
        assert!(validate_beat_url("ftp://cdn.example.com/beat.mp3").is_err());
        assert!(validate_beat_url("https://").is_err());
        assert!(validate_beat_url("https://cdn.example.com/my beat.mp3").is_err());
        assert!(validate_beat_url(&format!("https://{}", "a".repeat(MAX_URL_LEN))).is_err());
    }

    #[test]
    fn test_validate_not_blank() {
        assert!(validate_not_blank("round one").is_ok());
        assert!(validate_not_blank("   ").is_err());
    }
}
