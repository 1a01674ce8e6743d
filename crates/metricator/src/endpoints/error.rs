use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metricator_service::caching::CacheError;
use metricator_service::tasks::{DispatchError, StatusError};
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<DispatchError> for ResponseError {
    fn from(err: DispatchError) -> Self {
        let status = match err {
            DispatchError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            DispatchError::DataUnavailable | DispatchError::TooManyRequests => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            err: err.into(),
        }
    }
}

impl From<StatusError> for ResponseError {
    fn from(err: StatusError) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            err: err.into(),
        }
    }
}

impl From<CacheError> for ResponseError {
    fn from(err: CacheError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: anyhow::Error::new(err).context("failed to read the cache"),
        }
    }
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((status, msg): (StatusCode, &'static str)) -> Self {
        Self {
            status,
            err: anyhow::anyhow!(msg),
        }
    }
}

impl From<anyhow::Error> for ResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() && self.status != StatusCode::SERVICE_UNAVAILABLE {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse { detail, causes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_errors_map_to_status_codes() {
        let status = |err: DispatchError| ResponseError::from(err).into_response().status();

        assert_eq!(
            status(DispatchError::InvalidArgument("no metrics provided".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status(DispatchError::DataUnavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(DispatchError::TooManyRequests), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(DispatchError::Store(CacheError::StoreUnavailable("disk".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn error_chain_becomes_causes() {
        let err = anyhow::Error::new(CacheError::CorruptEntry("bad json".into()))
            .context("failed to read the cache");
        let response = ApiErrorResponse::from(err);

        assert_eq!(response.detail.as_deref(), Some("failed to read the cache"));
        assert_eq!(response.causes.map(|c| c.len()), Some(1));
    }
}
