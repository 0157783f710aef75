use crate::api::error::AppError;
use axum::{
    Json,
    extract::{
        FromRequest, Request,
        rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    },
};
use garde::Validate;
use serde::de::DeserializeOwned;

pub(crate) struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    <T as Validate>::Context: Default,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await.map_err(|err| {
            if matches!(
                err,
                JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
                    FailedToBufferBody::LengthLimitError(_)
                ))
            ) {
                AppError::PayloadTooLarge
            } else {
                err.into()
            }
        })?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}
