use std::sync::LazyLock;

use regex::Regex;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
});

/// Loose format check run before an address is sent anywhere.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email.trim())
}

/// Trims and lower-cases an address so duplicates collapse.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_addresses() {
        assert!(is_valid_email("reader@example.com"));
        assert!(is_valid_email("  first.last+blog@mail.example.co.uk "));
    }

    #[test]
    fn rejects_malformed_addresses() {
        for email in ["", "reader", "reader@", "@example.com", "a b@example.com", "reader@example"] {
            assert!(!is_valid_email(email), "{email:?} should be rejected");
        }
    }

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(normalize_email(" Reader@Example.COM "), "reader@example.com");
    }
}
