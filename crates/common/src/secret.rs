//! Secret wrapper for API key material

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs, zeroed on drop
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Shortened preview of a key for admin displays, e.g. `tvly-a...3f9b`.
///
/// Short values keep only the first three and last two characters so the
/// preview never reconstructs the secret.
pub fn mask_key(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 10 {
        let head: String = chars.iter().take(3).collect();
        let tail: String = chars[chars.len().saturating_sub(2)..].iter().collect();
        return format!("{head}...{tail}");
    }
    let head: String = chars.iter().take(6).collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_redacts_debug_and_display() {
        let secret = Secret::new(String::from("tvly-dev-abc123"));
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
        assert_eq!(format!("{}", secret), "[REDACTED]");
    }

    #[test]
    fn secret_exposes_value() {
        let secret = Secret::new(String::from("tvly-dev-abc123"));
        assert_eq!(secret.expose(), "tvly-dev-abc123");
    }

    #[test]
    fn mask_key_long_value() {
        assert_eq!(mask_key("tvly-dev-abcdef123456"), "tvly-d...3456");
    }

    #[test]
    fn mask_key_short_value() {
        assert_eq!(mask_key("abcdefgh"), "abc...gh");
    }

    #[test]
    fn mask_key_empty() {
        assert_eq!(mask_key(""), "");
    }

    #[test]
    fn mask_key_never_echoes_middle() {
        let masked = mask_key("tvly-dev-SECRETMIDDLE-99");
        assert!(!masked.contains("SECRETMIDDLE"));
    }
}
