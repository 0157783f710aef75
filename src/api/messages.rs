use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use garde::Validate;
use uuid::Uuid;

use crate::{
    mail::MailMessage,
    registry::{JobState, RuntimeItem},
};

use super::{
    ApiState,
    auth::AuthToken,
    error::{AppError, ApiResult, PrettyJson},
    validation::ValidatedJson,
};

impl Validate for MailMessage {
    type Context = ();

    fn validate_into(
        &self,
        _ctx: &Self::Context,
        _parent: &mut dyn FnMut() -> garde::Path,
        report: &mut garde::Report,
    ) {
        if self.address_to.parse::<email_address::EmailAddress>().is_err() {
            report.append(garde::Path::new("address_to"), garde::Error::new("not a valid email address"));
        }
        if self.subject.is_empty() {
            report.append(garde::Path::new("subject"), garde::Error::new("must not be empty"));
        }
        if self.data.is_empty() {
            report.append(garde::Path::new("data"), garde::Error::new("must contain at least one part"));
        }
    }
}

/// Fetch a job's current delivery state and event log.
#[utoipa::path(get, path = "/message/{guid}",
    tags = ["mail"],
    responses((status = 200, body = RuntimeItem), (status = 404, description = "unknown guid")))]
pub async fn get_message(
    Path(guid): Path<Uuid>,
    State(state): State<ApiState>,
    _auth: AuthToken,
) -> ApiResult<RuntimeItem> {
    let item = state
        .registry
        .get(&guid.to_string())
        .ok_or(AppError::NotFound)?;
    Ok(PrettyJson(item.without_attachment_bodies()))
}

/// Submit a message and wait for delivery to complete before responding.
#[utoipa::path(post, path = "/message/send",
    tags = ["mail"],
    request_body = MailMessage,
    responses((status = 200, body = RuntimeItem), (status = 418, description = "delivery failed")))]
pub async fn send_message(
    State(state): State<ApiState>,
    _auth: AuthToken,
    ValidatedJson(message): ValidatedJson<MailMessage>,
) -> Result<impl IntoResponse, AppError> {
    let guid = Uuid::new_v4().to_string();
    let message = message.normalize(guid.clone(), &state.config);
    state
        .registry
        .insert(guid.clone(), RuntimeItem::new(message));

    state.engine.deliver(&guid).await;

    let item = state.registry.get(&guid).expect("just inserted");
    let status = match item.state {
        JobState::Sended => StatusCode::OK,
        _ => StatusCode::IM_A_TEAPOT,
    };
    Ok((status, PrettyJson(item.without_attachment_bodies())))
}

/// Submit a message and schedule delivery in the background.
#[utoipa::path(post, path = "/message/async-send",
    tags = ["mail"],
    request_body = MailMessage,
    responses((status = 200, body = RuntimeItem)))]
pub async fn async_send_message(
    State(state): State<ApiState>,
    _auth: AuthToken,
    ValidatedJson(message): ValidatedJson<MailMessage>,
) -> ApiResult<RuntimeItem> {
    let guid = Uuid::new_v4().to_string();
    let message = message.normalize(guid.clone(), &state.config);
    state
        .registry
        .insert(guid.clone(), RuntimeItem::new(message));

    let engine = state.engine.clone();
    let background_guid = guid.clone();
    tokio::spawn(async move {
        engine.deliver(&background_guid).await;
    });

    let item = state.registry.get(&guid).expect("just inserted");
    Ok(PrettyJson(item.without_attachment_bodies()))
}
