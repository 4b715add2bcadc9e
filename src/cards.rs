//! 卡片处理器：签发、查询与换发。

use axum::extract::{Extension, Json};
use axum::response::Json as JsonResponse;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use serde::Deserialize;
use std::sync::Arc;

use crate::admin::{AdminPassword, password_matches};
use crate::error::ApiError;
use crate::model::{Card, Level};
use crate::service::{BoxService, IssuedCard};

#[derive(Deserialize)]
pub(crate) struct IssueCardBody {
    password: String,
}

type CardBearer = Option<TypedHeader<Authorization<Bearer>>>;

fn bearer_card(service: &BoxService, bearer: CardBearer) -> Result<Card, ApiError> {
    bearer
        .and_then(|TypedHeader(auth)| service.resolve_card(auth.token()))
        .ok_or(ApiError::NotFound)
}

/// 管理员签发一张红色卡片。
pub async fn issue_card(
    Extension(service): Extension<Arc<BoxService>>,
    Extension(admin): Extension<AdminPassword>,
    Json(payload): Json<IssueCardBody>,
) -> Result<JsonResponse<IssuedCard>, ApiError> {
    if !password_matches(&admin, &payload.password) {
        return Err(ApiError::Forbidden);
    }
    Ok(JsonResponse(service.issue_card(Level::Red).await?))
}

pub async fn card_detail(
    bearer: CardBearer,
    Extension(service): Extension<Arc<BoxService>>,
) -> Result<JsonResponse<Card>, ApiError> {
    let card = bearer_card(&service, bearer)?;
    Ok(JsonResponse(service.card_detail(&card)?))
}

/// 用当前卡片换发新卡，旧令牌随即失效。
pub async fn renew_card(
    bearer: CardBearer,
    Extension(service): Extension<Arc<BoxService>>,
) -> Result<JsonResponse<IssuedCard>, ApiError> {
    let card = bearer_card(&service, bearer)?;
    Ok(JsonResponse(service.renew_card(&card).await?))
}
