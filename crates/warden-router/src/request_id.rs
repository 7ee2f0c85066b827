//! Deterministic adapter request ids.
//!
//! Redelivery of the same platform message yields the same id, so idempotent
//! handlers suppress duplicate side effects. An explicit retry perturbs the id
//! of the message it targets with the retry message's own id, so every retry
//! is a fresh attempt while a redelivered retry still maps to one id. Nothing
//! here lives in memory: ids survive restarts exactly like the task records
//! they key.

use sha2::{Digest, Sha256};

use crate::context::RouteContext;

pub const REQUEST_ID_PREFIX: &str = "req-";
const REQUEST_ID_HEX_LEN: usize = 20;
const FIELD_SEPARATOR: char = '\u{1f}';
const RETRY_MATERIAL_TAG: &str = "retry";

fn base_material(channel: &str, chat_id: &str, message_id: &str) -> String {
    format!(
        "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}",
        channel.trim(),
        chat_id.trim(),
        message_id.trim()
    )
}

fn hashed_request_id(material: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(material.as_bytes()));
    format!("{REQUEST_ID_PREFIX}{}", &digest[..REQUEST_ID_HEX_LEN])
}

/// `req-<sha256 prefix>` over channel, chat id, message id and, when
/// non-zero, the attempt number.
pub fn derive_request_id(channel: &str, chat_id: &str, message_id: &str, attempt: u32) -> String {
    let mut material = base_material(channel, chat_id, message_id);
    if attempt > 0 {
        material.push(FIELD_SEPARATOR);
        material.push_str(&attempt.to_string());
    }
    hashed_request_id(&material)
}

/// Id of the attempt that retry message `retry_message_id` starts for
/// `message_id`. Distinct from every numbered attempt of the same message.
pub fn derive_retry_request_id(
    channel: &str,
    chat_id: &str,
    message_id: &str,
    retry_message_id: &str,
) -> String {
    let mut material = base_material(channel, chat_id, message_id);
    material.push(FIELD_SEPARATOR);
    material.push_str(RETRY_MATERIAL_TAG);
    material.push(FIELD_SEPARATOR);
    material.push_str(retry_message_id.trim());
    hashed_request_id(&material)
}

/// Id for the message in `ctx`. A retry targets the replied-to message when
/// there is one, otherwise the message itself.
pub fn request_id_for_context(ctx: &RouteContext) -> String {
    let event = &ctx.event;
    let message_id = event.message_id.as_deref().map(str::trim).unwrap_or_default();
    let reply_to_id = event
        .reply_to_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());
    if ctx.explicit_retry {
        let base = reply_to_id.unwrap_or(message_id);
        if message_id.is_empty() {
            return derive_request_id(&event.channel, &event.chat_id, base, 1);
        }
        return derive_retry_request_id(&event.channel, &event.chat_id, base, message_id);
    }
    let base = if message_id.is_empty() {
        reply_to_id.unwrap_or_default()
    } else {
        message_id
    };
    derive_request_id(&event.channel, &event.chat_id, base, 0)
}

#[cfg(test)]
mod tests {
    use super::{
        derive_request_id, derive_retry_request_id, request_id_for_context, REQUEST_ID_PREFIX,
    };
    use crate::context::{MessageEvent, RouteContext, RouteSettings};

    fn context(text: &str, message_id: &str, reply_to_id: Option<&str>) -> RouteContext {
        RouteContext::build(
            MessageEvent {
                channel: "telegram".to_string(),
                chat_id: "1001".to_string(),
                chat_type: "private".to_string(),
                user_id: "1001".to_string(),
                message_id: Some(message_id.to_string()),
                reply_to_id: reply_to_id.map(str::to_string),
                text: text.to_string(),
                ..MessageEvent::default()
            },
            &RouteSettings::default(),
        )
    }

    #[test]
    fn unit_request_id_is_deterministic_and_attempt_sensitive() {
        let first = derive_request_id("telegram", "1001", "55", 0);
        assert!(first.starts_with(REQUEST_ID_PREFIX));
        assert_eq!(first.len(), REQUEST_ID_PREFIX.len() + 20);
        assert_eq!(first, derive_request_id(" telegram", "1001 ", "55", 0));
        assert_ne!(first, derive_request_id("telegram", "1001", "55", 1));
        assert_ne!(first, derive_request_id("telegram", "1001", "56", 0));
    }

    #[test]
    fn functional_redelivery_reuses_id_and_explicit_retry_perturbs_it() {
        let original = request_id_for_context(&context("explain", "55", None));
        let redelivered = request_id_for_context(&context("explain", "55", None));
        assert_eq!(original, redelivered);

        let retry_once = request_id_for_context(&context("retry", "60", Some("55")));
        let retry_twice = request_id_for_context(&context("retry", "61", Some("55")));
        assert_eq!(retry_once, derive_retry_request_id("telegram", "1001", "55", "60"));
        assert_ne!(retry_once, original);
        assert_ne!(retry_once, retry_twice);
        assert_ne!(retry_once, derive_request_id("telegram", "1001", "55", 1));
    }

    #[test]
    fn regression_redelivered_retry_message_keeps_its_attempt_id() {
        let first = request_id_for_context(&context("retry", "60", Some("55")));
        let redelivered = request_id_for_context(&context("retry", "60", Some("55")));
        assert_eq!(first, redelivered);

        let self_retry = request_id_for_context(&context("retry explain", "70", None));
        assert_eq!(self_retry, derive_retry_request_id("telegram", "1001", "70", "70"));
        assert_ne!(self_retry, derive_request_id("telegram", "1001", "70", 0));
    }
}
