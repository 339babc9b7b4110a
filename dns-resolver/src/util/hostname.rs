use regex::Regex;
use std::sync::OnceLock;

/// A conservative syntactic hostname check (RFC 1123 labels): each
/// label is 1-63 characters, alphanumeric or hyphen, and may not
/// start or end with a hyphen. An optional trailing dot is allowed.
/// This rejects the input before any network activity happens, per
/// the resolver's validation step; it does not attempt to implement
/// full RFC 1035 domain name syntax (underscores in service records,
/// internationalised names, and the like are out of scope).
pub fn is_valid_hostname(candidate: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^
            ([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)
            (\.([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?))*
            \.?
            $
            ",
        )
        .expect("hostname regex is a compile-time constant")
    });

    !candidate.is_empty() && candidate.len() <= 253 && re.is_match(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_hostnames() {
        assert!(is_valid_hostname("shuckle.ru.nl"));
        assert!(is_valid_hostname("shuckle.ru.nl."));
        assert!(is_valid_hostname("a.b.c"));
        assert!(is_valid_hostname("xn--80ak6aa92e.com"));
    }

    #[test]
    fn rejects_malformed_hostnames() {
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("---not..valid"));
        assert!(!is_valid_hostname(".leading-dot.com"));
        assert!(!is_valid_hostname("-leading-hyphen.com"));
        assert!(!is_valid_hostname("trailing-hyphen-.com"));
        assert!(!is_valid_hostname("has a space.com"));
    }
}
