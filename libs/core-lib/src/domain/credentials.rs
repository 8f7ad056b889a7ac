use rand::Rng;
use rand::seq::IndexedRandom;

pub const GENERATED_PASSWORD_LENGTH: usize = 12;
pub const MIN_PASSWORD_LENGTH: usize = 8;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*";

/// Random password containing at least one of each character class.
pub fn generate_password() -> String {
    let alphabet: Vec<u8> = [LOWER, UPPER, DIGITS, SYMBOLS].concat();
    let mut rng = rand::rng();
    loop {
        let candidate: String = (0..GENERATED_PASSWORD_LENGTH)
            .filter_map(|_| alphabet.choose(&mut rng).map(|b| *b as char))
            .collect();
        if meets_policy(&candidate) {
            return candidate;
        }
    }
}

/// Uniform six digit code in `100000..=999999`.
pub fn generate_verification_code() -> String {
    rand::rng().random_range(100_000u32..=999_999).to_string()
}

/// Shape rules for any password this system hands out or accepts.
pub fn meets_policy(password: &str) -> bool {
    let has = |set: &[u8]| password.bytes().any(|b| set.contains(&b));
    password.chars().count() >= MIN_PASSWORD_LENGTH
        && has(LOWER)
        && has(UPPER)
        && has(DIGITS)
        && has(SYMBOLS)
}

/// Looser rule for passwords a person picks themselves.
pub fn acceptable_user_password(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_LENGTH
        && password.chars().any(|c| c.is_ascii_alphabetic())
        && password.chars().any(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_passwords_meet_policy() {
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let p = generate_password();
            assert_eq!(p.len(), GENERATED_PASSWORD_LENGTH);
            assert!(meets_policy(&p), "weak password generated: {p}");
            assert!(p.bytes().all(|b| LOWER.contains(&b)
                || UPPER.contains(&b)
                || DIGITS.contains(&b)
                || SYMBOLS.contains(&b)));
            seen.insert(p);
        }
        assert!(seen.len() > 490);
    }

    #[test]
    fn test_verification_code_shape() {
        for _ in 0..500 {
            let code = generate_verification_code();
            assert_eq!(code.len(), 6);
            let n: u32 = code.parse().unwrap();
            assert!((100_000..=999_999).contains(&n));
        }
    }

    #[test]
    fn test_policy_rejects_missing_classes() {
        assert!(!meets_policy("abcdefgh"));
        assert!(!meets_policy("Abcdefg1"));
        assert!(!meets_policy("A1!a"));
        assert!(meets_policy("Abcdef1!"));
    }

    #[test]
    fn test_user_password_rule() {
        assert!(acceptable_user_password("hunter2hunter"));
        assert!(!acceptable_user_password("short1"));
        assert!(!acceptable_user_password("onlyletters"));
    }
}
