//! API key authorization middleware for the procedure routes.
//!
//! This middleware intercepts every procedure request to:
//! 1. Read the key from the `x-mirabel-developer-key` header
//! 2. Run the authorization strategy governing the route and service
//! 3. Inject [`AuthContext`] into the request on success
//! 4. Answer with the denial as a JSON error otherwise
//!
//! Either way the [`UsageTrace`] of what was resolved is attached to the
//! response so the usage middleware can attribute the request.
//!
//! [`UsageTrace`]: crate::services::usage_recorder::UsageTrace

use axum::{
    extract::{Path, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    services::authorization::{AuthContext, AuthRequest, RouteKind},
    state::AppState,
};

/// Header carrying the application, legacy or endpoint key.
pub const API_KEY_HEADER: &str = "x-mirabel-developer-key";

/// Authorization for `/api/{service}/_proc/{procedure}`.
///
/// Consolidated or Legacy strategy, depending on the service.
pub async fn internal_auth(
    State(state): State<AppState>,
    Path((service, procedure)): Path<(String, String)>,
    request: Request,
    next: Next,
) -> Response {
    authorize(state, RouteKind::Internal, &service, &procedure, request, next).await
}

/// Authorization for `/public/{service}/_proc/{procedure}` with endpoint keys.
pub async fn public_auth(
    State(state): State<AppState>,
    Path((service, procedure)): Path<(String, String)>,
    request: Request,
    next: Next,
) -> Response {
    authorize(state, RouteKind::Public, &service, &procedure, request, next).await
}

async fn authorize(
    state: AppState,
    route: RouteKind,
    service: &str,
    procedure: &str,
    mut request: Request,
    next: Next,
) -> Response {
    let key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string);
    let method = request.method().clone();

    let decision = state
        .authorizer
        .authorize(
            route,
            &AuthRequest {
                key: key.as_deref(),
                service,
                procedure,
                method: &method,
            },
        )
        .await;

    let mut response = match decision.outcome {
        Ok(context) => {
            // Handlers extract this with Extension<AuthContext>
            request.extensions_mut().insert::<AuthContext>(context);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    };

    response.extensions_mut().insert(decision.trace);
    response
}
