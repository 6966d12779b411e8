//! Pre-upgrade identity establishment for the WebSocket endpoint
//!
//! A connection arrives either with a bearer token from a prior login, or
//! with a display name (and optional email) for guest messaging. Identity is
//! settled before the protocol upgrade so a rejected request is a plain HTTP
//! error.

use std::collections::HashMap;

use axum::http::HeaderMap;
use tracing::info;

use crate::auth::token::verify_token;
use crate::store::Subscriber;

/// Why a connection was refused before upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRejection {
    /// Neither a token nor a name was supplied.
    MissingCredentials,
    /// A token was supplied but did not verify.
    InvalidToken,
}

/// Establish the connecting subscriber from query parameters and headers.
pub fn subscriber_from_request(
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<Subscriber, IdentityRejection> {
    if let Some(token) = bearer_token(params, headers) {
        let claims = verify_token(&token).map_err(|_| IdentityRejection::InvalidToken)?;
        info!(user = %claims.name, "Authenticated request");
        return Ok(Subscriber::registered(claims.id, claims.name));
    }

    if let Some(name) = params.get("name").filter(|name| !name.is_empty()) {
        let email = params.get("email").filter(|e| !e.is_empty()).cloned();
        let anon = Subscriber::anonymous(name.clone(), email);
        info!(user = %anon.id, "Anonymous request");
        return Ok(anon);
    }

    Err(IdentityRejection::MissingCredentials)
}

fn bearer_token(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = params
        .get("token")
        .or_else(|| params.get("jwt"))
        .filter(|token| !token.is_empty())
    {
        return Some(token.clone());
    }

    headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::issue_token;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_credentials() {
        let result = subscriber_from_request(&HashMap::new(), &HeaderMap::new());
        assert_eq!(result.unwrap_err(), IdentityRejection::MissingCredentials);
    }

    #[test]
    fn test_anonymous_from_name() {
        let subscriber = subscriber_from_request(
            &params(&[("name", "santzky"), ("email", "s@example.com")]),
            &HeaderMap::new(),
        )
        .unwrap();
        assert_eq!(subscriber.name, "santzky");
        assert_eq!(subscriber.email.as_deref(), Some("s@example.com"));
        assert!(!subscriber.id.is_empty());
    }

    #[test]
    fn test_registered_from_query_token() {
        let meta = issue_token(&Subscriber::registered("s1", "santzky")).unwrap();
        let subscriber =
            subscriber_from_request(&params(&[("token", &meta.access_token)]), &HeaderMap::new())
                .unwrap();
        assert_eq!(subscriber.id, "s1");
        assert_eq!(subscriber.name, "santzky");
    }

    #[test]
    fn test_registered_from_bearer_header() {
        let meta = issue_token(&Subscriber::registered("s1", "santzky")).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            format!("Bearer {}", meta.access_token).parse().unwrap(),
        );
        let subscriber = subscriber_from_request(&HashMap::new(), &headers).unwrap();
        assert_eq!(subscriber.name, "santzky");
    }

    #[test]
    fn test_invalid_token_rejected() {
        let result =
            subscriber_from_request(&params(&[("jwt", "garbage")]), &HeaderMap::new());
        assert_eq!(result.unwrap_err(), IdentityRejection::InvalidToken);
    }

    #[test]
    fn test_token_wins_over_name() {
        let meta = issue_token(&Subscriber::registered("s1", "santzky")).unwrap();
        let subscriber = subscriber_from_request(
            &params(&[("token", &meta.access_token), ("name", "someone-else")]),
            &HeaderMap::new(),
        )
        .unwrap();
        assert_eq!(subscriber.id, "s1");
    }
}
