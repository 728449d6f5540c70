use rand::Rng;

const SECRET_LEN: usize = 16;
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate the process-wide hook-server secret. Called exactly once at
/// startup and stored read-only in `AppState` for the process lifetime.
pub fn generate_hook_secret() -> String {
    let mut rng = rand::thread_rng();
    (0..SECRET_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// Constant-time comparison so the State Hook Endpoint's auth check doesn't
/// leak timing information about how many leading characters matched.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_has_expected_length_and_alphabet() {
        let secret = generate_hook_secret();
        assert_eq!(secret.len(), SECRET_LEN);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("abcdef1234567890", "abcdef1234567890"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_strings() {
        assert!(!constant_time_eq("abcdef1234567890", "abcdef1234567891"));
        assert!(!constant_time_eq("short", "longerstring"));
    }
}
