use rand::{distributions::Alphanumeric, Rng};

const TOKEN_LEN: usize = 32;

/// Unguessable token from the thread-local CSPRNG. Used for QR codes and order access tokens.
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_long_and_distinct() {
        let tokens: HashSet<String> = (0..1000).map(|_| random_token()).collect();
        assert_eq!(tokens.len(), 1000);
        assert!(tokens
            .iter()
            .all(|token| token.len() == TOKEN_LEN && token.chars().all(|c| c.is_ascii_alphanumeric())));
    }
}
