use crate::api::TrackerError;
use crate::token::{TokenGenerator, TokenKind};

/// Validates a device cookie.
pub fn authorized(tokens: &TokenGenerator, cookie: Option<&str>) -> Result<(), TrackerError> {
    check(tokens, cookie, TokenKind::Device).map(|_| ())
}

/// Validates a user cookie, returning the hashed user id it was minted for.
pub fn hash_authorized(
    tokens: &TokenGenerator,
    cookie: Option<&str>,
) -> Result<String, TrackerError> {
    check(tokens, cookie, TokenKind::User)
}

fn check(
    tokens: &TokenGenerator,
    cookie: Option<&str>,
    kind: TokenKind,
) -> Result<String, TrackerError> {
    let cookie = cookie.ok_or_else(|| TrackerError::Unauthorized("no cookie".to_string()))?;

    tokens
        .verify(cookie, kind)
        .map_err(|reason| TrackerError::Unauthorized(format!("cookie rejected: {reason}")))
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn accepts_cookies_it_minted() {
        let tokens = TokenGenerator::new("secret").unwrap();

        let device = tokens.generate_token(1, Uuid::new_v4());
        assert!(authorized(&tokens, Some(&device)).is_ok());

        let hashed = tokens.hash_user_id("user-1");
        let user = tokens.generate_hash_token(&hashed);
        assert_eq!(hash_authorized(&tokens, Some(&user)).unwrap(), hashed);
    }

    #[test]
    fn missing_or_invalid_cookies_are_unauthorized() {
        let tokens = TokenGenerator::new("secret").unwrap();
        let device = tokens.generate_token(1, Uuid::new_v4());

        for result in [
            authorized(&tokens, None),
            authorized(&tokens, Some("garbage")),
            hash_authorized(&tokens, Some(&device)).map(|_| ()),
        ] {
            match result {
                Err(TrackerError::Unauthorized(_)) => (),
                other => panic!("expected Unauthorized, got {other:?}"),
            }
        }
    }
}
