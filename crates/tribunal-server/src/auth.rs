use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use tribunal_core::context::{Context, Role};
use tribunal_core::errors::CoreError;

/// Resolved bearer claims. The core never sees the token itself.
#[derive(Debug, Clone)]
pub struct Claims {
    pub tenant_id: String,
    pub role: Role,
    pub user_id: String,
}

/// Port to the external authorizer. The default implementation is a static
/// token map; a real IdP integration plugs in behind the same trait.
pub trait Authorizer: Send + Sync {
    fn resolve(&self, token: &str) -> Option<Claims>;
}

#[derive(Default)]
pub struct StaticAuthorizer {
    tokens: HashMap<String, Claims>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `AUTH_TOKENS` format: `token=tenant:role:user` entries separated by
    /// commas, e.g. `s3cret=acme:admin:ops,r0=acme:viewer:dash`.
    pub fn from_env() -> Self {
        let mut auth = Self::new();
        if let Ok(raw) = std::env::var("AUTH_TOKENS") {
            for entry in raw.split(',') {
                let Some((token, spec)) = entry.split_once('=') else {
                    continue;
                };
                let parts: Vec<&str> = spec.splitn(3, ':').collect();
                if parts.len() != 3 {
                    tracing::warn!(event = "auth_token_malformed", entry = %entry);
                    continue;
                }
                let Some(role) = Role::parse(parts[1]) else {
                    tracing::warn!(event = "auth_token_bad_role", role = parts[1]);
                    continue;
                };
                auth.insert(
                    token,
                    Claims {
                        tenant_id: parts[0].to_string(),
                        role,
                        user_id: parts[2].to_string(),
                    },
                );
            }
        }
        auth
    }

    pub fn insert(&mut self, token: &str, claims: Claims) {
        self.tokens.insert(token.to_string(), claims);
    }
}

impl Authorizer for StaticAuthorizer {
    fn resolve(&self, token: &str) -> Option<Claims> {
        self.tokens.get(token).cloned()
    }
}

/// Builds the request `Context` from resolved claims plus the
/// `Idempotency-Key` header. Bodies never contribute to identity.
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(claims) = token.and_then(|t| state.authorizer.resolve(t)) else {
        return ApiError::from(CoreError::Forbidden("invalid bearer credential".into()))
            .into_response();
    };

    let idempotency_key = req
        .headers()
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let ctx = Context::new(claims.tenant_id, claims.role, claims.user_id)
        .with_idempotency_key(idempotency_key);
    req.extensions_mut().insert(ctx);
    next.run(req).await
}
