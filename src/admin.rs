//! 管理接口：`token` 请求头等于管理员密码时放行。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, Request};
use axum::middleware;
use axum::response::{Json as JsonResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::ApiError;
use crate::http::ClientIp;
use crate::model::FileBox;
use crate::service::BoxService;

const ADMIN_TOKEN_HEADER: &str = "token";

#[derive(Clone)]
pub struct AdminPassword(pub Arc<str>);

pub fn password_matches(admin: &AdminPassword, candidate: &str) -> bool {
    bool::from(admin.0.as_bytes().ct_eq(candidate.as_bytes()))
}

fn token_matches(admin: &AdminPassword, headers: &HeaderMap) -> bool {
    headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|token| password_matches(admin, token))
}

/// 管理路由中间件。
pub async fn require_admin(
    Extension(admin): Extension<AdminPassword>,
    ClientIp(ip): ClientIp,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if token_matches(&admin, req.headers()) {
        return Ok(next.run(req).await);
    }
    warn!(client_ip = %ip, path = req.uri().path(), "rejected admin request");
    Err(ApiError::Forbidden)
}

#[derive(Deserialize)]
pub(crate) struct ListBoxesQuery {
    #[serde(default)]
    expired: bool,
}

/// Lists active boxes, or those waiting for archival with `?expired=true`.
pub async fn list_boxes(
    Query(query): Query<ListBoxesQuery>,
    Extension(service): Extension<Arc<BoxService>>,
) -> JsonResponse<Vec<FileBox>> {
    JsonResponse(service.admin_list_boxes(query.expired))
}

pub async fn get_box(
    Path(code): Path<String>,
    Extension(service): Extension<Arc<BoxService>>,
) -> Result<JsonResponse<FileBox>, ApiError> {
    service
        .admin_get_box(&code)
        .map(JsonResponse)
        .ok_or(ApiError::NotFound)
}
