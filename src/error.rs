use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

/// Every way a request can end other than with an embedding.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("No image_base64 provided")]
    MissingImage,

    #[error("Face could not be detected in the image.")]
    NoFaceDetected,

    #[error("An unexpected error occurred in the AI service: {0:#}")]
    Unexpected(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ResponseError for EmbedError {
    fn status_code(&self) -> StatusCode {
        match self {
            EmbedError::MissingImage | EmbedError::NoFaceDetected => StatusCode::BAD_REQUEST,
            EmbedError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(ErrorBody {
                error: self.to_string(),
            })
    }
}

impl From<base64::DecodeError> for EmbedError {
    fn from(err: base64::DecodeError) -> Self {
        EmbedError::Unexpected(anyhow::Error::new(err).context("decoding base64 image"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn status_codes() {
        assert_eq!(EmbedError::MissingImage.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(EmbedError::NoFaceDetected.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            EmbedError::Unexpected(anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn unexpected_message_carries_context_chain() {
        let err = EmbedError::Unexpected(anyhow!("bad header").context("reading request"));
        assert_eq!(
            err.to_string(),
            "An unexpected error occurred in the AI service: reading request: bad header"
        );
    }
}
