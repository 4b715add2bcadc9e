//! 盒子与文件处理器：建盒、分片上传、完成与下载（支持 Range）。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use bytes::{Bytes, BytesMut};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use httpdate::{fmt_http_date, parse_http_date};
use percent_encoding::utf8_percent_encode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::MAX_CHUNK_SIZE;
use crate::error::ApiError;
use crate::http::ClientIp;
use crate::model::{FileSpec, UploadFail};
use crate::service::BoxService;
use crate::storage::PATH_SEGMENT;

const CHUNK_OFFSET_HEADER: &str = "x-chunk-offset";
const CHUNK_SHA256_HEADER: &str = "x-chunk-sha256";
/// Request headers never copied into the completion log.
const UNLOGGED_HEADERS: [&str; 3] = ["authorization", "cookie", "token"];

#[derive(Deserialize)]
pub(crate) struct FinalizeFileBody {
    sha256: String,
    #[serde(default)]
    extra: Value,
}

/// 存储占用（0-200）。
pub async fn get_capacity(
    Extension(service): Extension<Arc<BoxService>>,
) -> Result<JsonResponse<Value>, ApiError> {
    let count = service.capacity().await?;
    Ok(JsonResponse(json!({ "count": count })))
}

/// 创建盒子；携带有效卡片令牌时按卡片等级计算配额。
pub async fn create_box(
    ClientIp(ip): ClientIp,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Extension(service): Extension<Arc<BoxService>>,
    Json(files): Json<Vec<FileSpec>>,
) -> Result<Response, ApiError> {
    let card = bearer.and_then(|TypedHeader(auth)| service.resolve_card(auth.token()));
    let created = service.create_box(ip, files, card).await?;
    let mut body = serde_json::to_value(&created).map_err(|err| ApiError::Internal(err.to_string()))?;
    body["detail"] = json!("20101");
    Ok((StatusCode::CREATED, JsonResponse(body)).into_response())
}

pub async fn get_box(
    ClientIp(ip): ClientIp,
    Path(code): Path<String>,
    Extension(service): Extension<Arc<BoxService>>,
) -> Result<Response, ApiError> {
    let view = service.fetch_box(ip, &code).await?;
    Ok(JsonResponse(view).into_response())
}

/// 完成盒子，并把请求头写入完成日志。
pub async fn finalize_box(
    ClientIp(ip): ClientIp,
    Path(code): Path<String>,
    headers: HeaderMap,
    Extension(service): Extension<Arc<BoxService>>,
) -> Result<JsonResponse<Value>, ApiError> {
    let entries: BTreeMap<String, String> = headers
        .iter()
        .filter(|(name, _)| !UNLOGGED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    service.finalize_box(ip, &code, entries).await?;
    Ok(JsonResponse(json!({ "code": code, "detail": "20001" })))
}

/// 上传单个分片：原始请求体，偏移与摘要放在请求头中。
pub async fn upload_chunk(
    ClientIp(ip): ClientIp,
    Path((code, filename)): Path<(String, String)>,
    headers: HeaderMap,
    Extension(service): Extension<Arc<BoxService>>,
    body: AxumBody,
) -> Result<JsonResponse<Value>, ApiError> {
    let offset = headers
        .get(CHUNK_OFFSET_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .ok_or(ApiError::Rejected(UploadFail::InvalidFile))?;
    let sha256 = headers
        .get(CHUNK_SHA256_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Rejected(UploadFail::InvalidFile))?
        .to_string();

    let chunk = read_chunk(body).await?;
    service
        .write_chunk(ip, &code, &filename, chunk, offset, &sha256)
        .await?;
    Ok(JsonResponse(
        json!({ "code": code, "filename": filename, "detail": "20001" }),
    ))
}

async fn read_chunk(body: AxumBody) -> Result<Bytes, ApiError> {
    let mut data_stream = BodyExt::into_data_stream(body);
    let mut buffer = BytesMut::new();
    while let Some(frame) = data_stream.next().await {
        let frame = frame.map_err(|err: AxumError| ApiError::Internal(err.to_string()))?;
        if buffer.len() + frame.len() > MAX_CHUNK_SIZE {
            return Err(ApiError::Rejected(UploadFail::BigFile));
        }
        buffer.extend_from_slice(&frame);
    }
    Ok(buffer.freeze())
}

/// 校验并完成单个文件。
pub async fn finalize_file(
    ClientIp(ip): ClientIp,
    Path((code, filename)): Path<(String, String)>,
    Extension(service): Extension<Arc<BoxService>>,
    Json(payload): Json<FinalizeFileBody>,
) -> Result<JsonResponse<Value>, ApiError> {
    service
        .finalize_file(ip, &code, &filename, &payload.sha256, payload.extra)
        .await?;
    Ok(JsonResponse(
        json!({ "code": code, "filename": filename, "detail": "20001" }),
    ))
}

/// 下载已完成的文件，支持单个 Range。
pub async fn download_file(
    ClientIp(ip): ClientIp,
    Path((code, filename)): Path<(String, String)>,
    request_headers: HeaderMap,
    Extension(service): Extension<Arc<BoxService>>,
) -> Result<Response, ApiError> {
    let (target, _file) = service.download_path(ip, &code, &filename).await?;
    let metadata = fs::metadata(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let mime = mime_guess::from_path(&filename).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    insert_header(&mut response_headers, header::CONTENT_TYPE, mime.essence_str())?;
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    insert_header(
        &mut response_headers,
        header::CONTENT_DISPOSITION,
        &format!(
            "attachment; filename*=UTF-8''{}",
            utf8_percent_encode(&filename, PATH_SEGMENT)
        ),
    )?;
    if let Some(modified) = modified {
        insert_header(
            &mut response_headers,
            header::LAST_MODIFIED,
            &fmt_http_date(modified),
        )?;
    }

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
            Err(_) => false,
        },
        None => true,
    };
    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let mut file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(code, filename, start, end, length, "download range request accepted");
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        insert_header(
            &mut response_headers,
            header::CONTENT_RANGE,
            &format!("bytes {start}-{end}/{file_size}"),
        )?;
        insert_header(&mut response_headers, header::CONTENT_LENGTH, &length.to_string())?;
        let stream = ReaderStream::new(file.take(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    insert_header(&mut response_headers, header::CONTENT_LENGTH, &file_size.to_string())?;
    info!(code, filename, size = file_size, "download full file");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

fn insert_header(
    headers: &mut HeaderMap,
    name: header::HeaderName,
    value: &str,
) -> Result<(), ApiError> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| ApiError::Internal("failed to build response header".into()))?;
    headers.insert(name, value);
    Ok(())
}

/// 解析 Range 头，返回可读取的闭区间；越过末尾的终点截断到文件末尾。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let Some(range) = value.to_str().ok().and_then(|v| v.strip_prefix("bytes=")) else {
        return Ok(None);
    };
    if range.contains(',') {
        // multiple ranges: serve the whole file
        return Ok(None);
    }
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    let (start_part, end_part) = range.split_once('-').unwrap_or((range, ""));
    let last = file_size - 1;
    let (start, end) = if start_part.is_empty() {
        let Ok(suffix) = end_part.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), last)
    } else {
        let Ok(start) = start_part.parse::<u64>() else {
            return Ok(None);
        };
        let end = if end_part.is_empty() {
            last
        } else {
            match end_part.parse::<u64>() {
                Ok(end) => end.min(last),
                Err(_) => return Ok(None),
            }
        };
        (start, end)
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(value: &'static str, size: u64) -> Result<Option<(u64, u64)>, ApiError> {
        parse_range(Some(&HeaderValue::from_static(value)), size)
    }

    #[test]
    fn single_ranges_are_resolved() {
        assert_eq!(range("bytes=0-99", 1024).expect("range"), Some((0, 99)));
        assert_eq!(range("bytes=1000-", 1024).expect("range"), Some((1000, 1023)));
        assert_eq!(range("bytes=-24", 1024).expect("range"), Some((1000, 1023)));
        assert_eq!(range("bytes=1000-5000", 1024).expect("range"), Some((1000, 1023)));
        assert_eq!(parse_range(None, 1024).expect("none"), None);
    }

    #[test]
    fn unsatisfiable_and_unsupported_ranges() {
        assert!(matches!(
            range("bytes=2048-", 1024),
            Err(ApiError::RangeNotSatisfiable(1024))
        ));
        assert!(matches!(
            range("bytes=10-5", 1024),
            Err(ApiError::RangeNotSatisfiable(1024))
        ));
        assert!(matches!(
            range("bytes=0-1", 0),
            Err(ApiError::RangeNotSatisfiable(0))
        ));
        assert_eq!(range("bytes=0-1,4-5", 1024).expect("multi"), None);
        assert_eq!(range("items=0-1", 1024).expect("unit"), None);
    }

    #[tokio::test]
    async fn oversized_chunk_bodies_are_rejected() {
        let body = AxumBody::from(vec![0u8; MAX_CHUNK_SIZE + 1]);
        assert!(matches!(
            read_chunk(body).await,
            Err(ApiError::Rejected(UploadFail::BigFile))
        ));
        let chunk = read_chunk(AxumBody::from("abc")).await.expect("chunk");
        assert_eq!(&chunk[..], b"abc");
    }
}
