use axum::http::StatusCode;
use axum::Json;

use crate::state::ErrorResponse;
use crate::store::StoreError;

pub fn json_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub fn store_error(err: StoreError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Cursor(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, err.to_string())
}

/// Runs catalog work off the async executor; merges may sleep or wait on the writer lock.
pub async fn blocking<T, F>(f: F) -> Result<T, (StatusCode, Json<ErrorResponse>)>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(store_error),
        Err(err) => Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("worker failed: {}", err),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_status() {
        assert_eq!(store_error(StoreError::NotFound(3)).0, StatusCode::NOT_FOUND);
        assert_eq!(
            store_error(StoreError::Cursor("x".into())).0,
            StatusCode::BAD_REQUEST
        );
        let (status, body) = store_error(StoreError::Integrity {
            sha1: "ab".into(),
            count: 2,
        });
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.0.error, "found 2 songs with SHA1 ab; expected 0 or 1");
    }
}
