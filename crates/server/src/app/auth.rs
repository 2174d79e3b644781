use super::AppState;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use courier_proto::ClientIdentity;
use std::sync::Arc;
use tracing::warn;

const UNAUTHORIZED_BODY: &str = "Unauthorized requests";

/// Authenticated caller attached to the request once the auth service has
/// accepted the bearer credential. The raw header is kept so side-channel
/// calls (attachment upload) can forward it unchanged.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub identity: ClientIdentity,
    pub bearer: String,
}

/// Defers credential verification to the auth service: the incoming
/// `Authorization` header is replayed against `/check-login` and the
/// returned identity is attached to the request. Any non-200 answer or
/// transport fault yields 401 with no session.
pub async fn check_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, &'static str)> {
    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let endpoint = format!("{}/check-login", state.config.auth_service_url);
    let response = state
        .http
        .post(&endpoint)
        .header("Authorization", bearer.as_str())
        .send()
        .await
        .map_err(|err| {
            warn!("auth service unreachable: {}", err);
            (StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY)
        })?;
    if response.status() != reqwest::StatusCode::OK {
        return Err((StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY));
    }
    let identity = response.json::<ClientIdentity>().await.map_err(|err| {
        warn!("auth response decode failed: {}", err);
        (StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY)
    })?;
    request.extensions_mut().insert(AuthContext { identity, bearer });
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_body_matches_contract() {
        assert_eq!(UNAUTHORIZED_BODY, "Unauthorized requests");
    }

    #[test]
    fn auth_context_keeps_raw_bearer() {
        let context = AuthContext {
            identity: ClientIdentity {
                uid: "u1".to_string(),
                username: "mona".to_string(),
            },
            bearer: "Bearer abc".to_string(),
        };
        assert_eq!(context.identity.uid, "u1");
        assert_eq!(context.bearer, "Bearer abc");
    }
}
