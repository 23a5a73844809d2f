use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// API错误类型
pub struct AppError(pub StatusCode, pub anyhow::Error);

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn unauthorized() -> Self {
        Self(StatusCode::UNAUTHORIZED, anyhow::anyhow!("token 校验失败"))
    }

    pub fn bad_request(message: &'static str) -> Self {
        Self(StatusCode::BAD_REQUEST, anyhow::anyhow!(message))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.0 == StatusCode::INTERNAL_SERVER_ERROR {
            (self.0, format!("Something went wrong: {}", self.1)).into_response()
        } else {
            (self.0, self.1.to_string()).into_response()
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, err.into())
    }
}
