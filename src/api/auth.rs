//! Authentication middleware for the REST API
//!
//! Every task route requires an `Authorization: Bearer <token>` header. The
//! token is resolved to an account by the configured [`TokenResolver`]; the
//! resulting [`AccountId`] is attached to the request as an extension for the
//! handlers to scope their queries by.

use crate::error::Error;
use crate::identity::TokenResolver;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Middleware that resolves the bearer token to the calling account
///
/// # Returns
///
/// Returns either:
/// - 401 Unauthorized if the header is missing, malformed, or the token does not resolve
/// - The response from the next handler, with the account id extension set
///
/// # Examples
///
/// ```no_run
/// use axum::{Router, middleware};
/// use std::sync::Arc;
/// use url_dl::api::auth::require_bearer_token;
/// use url_dl::config::AuthConfig;
/// use url_dl::identity::{StaticTokenResolver, TokenResolver};
///
/// let resolver: Arc<dyn TokenResolver> =
///     Arc::new(StaticTokenResolver::new(&AuthConfig::default()));
/// let router: Router = Router::new()
///     .layer(middleware::from_fn_with_state(resolver, require_bearer_token));
/// ```
pub async fn require_bearer_token(
    State(resolver): State<Arc<dyn TokenResolver>>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let Some(header) = header else {
        return Error::Unauthenticated("missing Authorization header".into()).into_response();
    };
    let Some(token) = bearer_token(header) else {
        return Error::Unauthenticated("expected a Bearer token".into()).into_response();
    };

    match resolver.resolve(token).await {
        Ok(session) => {
            request.extensions_mut().insert(session.account_id);
            next.run(request).await
        }
        Err(e) => {
            tracing::debug!(error = %e, "Rejected API request");
            e.into_response()
        }
    }
}

/// Extract the token from a `Bearer <token>` header value
///
/// The scheme is matched case-insensitively; the token itself is taken as is.
fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim_start();
    (!token.is_empty()).then_some(token)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, StaticTokenConfig};
    use crate::identity::StaticTokenResolver;
    use crate::types::AccountId;
    use axum::{
        Extension, Router,
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::get,
    };
    use tower::ServiceExt; // for oneshot

    // Echoes the resolved account id
    async fn whoami(Extension(account): Extension<AccountId>) -> String {
        account.to_string()
    }

    fn app() -> Router {
        let resolver: Arc<dyn TokenResolver> = Arc::new(StaticTokenResolver::new(&AuthConfig {
            tokens: vec![StaticTokenConfig {
                token: "alice-token".into(),
                account_id: AccountId(7),
                expires_at: None,
            }],
        }));
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn_with_state(resolver, require_bearer_token))
    }

    async fn call(authorization: Option<&str>) -> (StatusCode, String) {
        let mut request = Request::builder().uri("/whoami");
        if let Some(value) = authorization {
            request = request.header("Authorization", value);
        }
        let response = app()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_valid_token_sets_account() {
        let (status, body) = call(Some("Bearer alice-token")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "7");
    }

    #[tokio::test]
    async fn test_scheme_is_case_insensitive() {
        let (status, _) = call(Some("bearer alice-token")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_header() {
        let (status, body) = call(None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("missing Authorization header"));
        assert!(body.contains("unauthorized"));
    }

    #[tokio::test]
    async fn test_wrong_scheme() {
        let (status, body) = call(Some("Basic YWxpY2U6c2VjcmV0")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Bearer"));
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let (status, body) = call(Some("Bearer mallory-token")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("unknown token"));
    }

    #[tokio::test]
    async fn test_token_is_case_sensitive() {
        let (status, _) = call(Some("Bearer ALICE-TOKEN")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("BEARER  abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Bearer"), None);
        assert_eq!(bearer_token("Token abc"), None);
    }
}
