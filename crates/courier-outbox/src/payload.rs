//! Typed outbox payloads.
//!
//! Each `kind` column value maps to one variant. Payloads are validated before
//! they are written, so a malformed message never reaches durable storage.

use crate::{OutboxError, OutboxResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

const WEBHOOK_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

/// A message waiting to be delivered by an external provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum OutboxMessage {
    Email(EmailMessage),
    Webhook(WebhookMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookMessage {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
    /// Signing secret handed to the dispatcher; never interpreted here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl OutboxMessage {
    /// Value stored in the `kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Email(_) => "email",
            Self::Webhook(_) => "webhook",
        }
    }

    pub fn validate(&self) -> OutboxResult<()> {
        match self {
            Self::Email(email) => email.validate(),
            Self::Webhook(webhook) => webhook.validate(),
        }
    }

    /// Split into the `kind` and `payload` columns.
    pub fn to_parts(&self) -> OutboxResult<(&'static str, String)> {
        let payload = match self {
            Self::Email(email) => serde_json::to_string(email)?,
            Self::Webhook(webhook) => serde_json::to_string(webhook)?,
        };
        Ok((self.kind(), payload))
    }

    /// Rebuild a message from its stored columns.
    pub fn from_parts(kind: &str, payload: &Value) -> OutboxResult<Self> {
        match kind {
            "email" => Ok(Self::Email(serde_json::from_value(payload.clone())?)),
            "webhook" => Ok(Self::Webhook(serde_json::from_value(payload.clone())?)),
            other => Err(OutboxError::InvalidPayload(format!("unknown kind {other:?}"))),
        }
    }
}

impl EmailMessage {
    fn validate(&self) -> OutboxResult<()> {
        if self.to.is_empty() {
            return Err(invalid("email needs at least one recipient"));
        }
        if let Some(bad) = self.to.iter().find(|addr| !looks_like_address(addr)) {
            return Err(invalid(format!("invalid recipient {bad:?}")));
        }
        if self.subject.trim().is_empty() {
            return Err(invalid("email subject is empty"));
        }
        let has_body = [&self.text_body, &self.html_body]
            .into_iter()
            .flatten()
            .any(|body| !body.trim().is_empty());
        if !has_body {
            return Err(invalid("email needs a text or html body"));
        }
        Ok(())
    }
}

impl WebhookMessage {
    fn validate(&self) -> OutboxResult<()> {
        let url = Url::parse(&self.url).map_err(|e| invalid(format!("invalid url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported url scheme {:?}", url.scheme())));
        }
        if !WEBHOOK_METHODS.contains(&self.method.as_str()) {
            return Err(invalid(format!("unsupported method {:?}", self.method)));
        }
        Ok(())
    }
}

fn looks_like_address(addr: &str) -> bool {
    match addr.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !addr.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn invalid(msg: impl Into<String>) -> OutboxError {
    OutboxError::InvalidPayload(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn email() -> EmailMessage {
        EmailMessage {
            to: vec!["ops@example.com".to_string()],
            subject: "Invoice ready".to_string(),
            text_body: Some("See attached.".to_string()),
            html_body: None,
        }
    }

    fn webhook() -> WebhookMessage {
        WebhookMessage {
            url: "https://hooks.example.com/events".to_string(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            body: json!({"event": "invoice.created"}),
            secret: None,
        }
    }

    #[test]
    fn tagged_json_shape() {
        let value = serde_json::to_value(OutboxMessage::Email(email())).unwrap();
        assert_eq!(value["kind"], "email");
        assert_eq!(value["payload"]["subject"], "Invoice ready");
    }

    #[test]
    fn parts_round_trip() {
        let message = OutboxMessage::Webhook(webhook());
        let (kind, payload) = message.to_parts().unwrap();
        assert_eq!(kind, "webhook");

        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(OutboxMessage::from_parts(kind, &value).unwrap(), message);
    }

    #[test]
    fn webhook_method_defaults_to_post() {
        let parsed =
            OutboxMessage::from_parts("webhook", &json!({"url": "http://localhost/x"})).unwrap();
        match parsed {
            OutboxMessage::Webhook(hook) => {
                assert_eq!(hook.method, "POST");
                assert_eq!(hook.body, Value::Null);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = OutboxMessage::from_parts("sms", &json!({})).unwrap_err();
        assert!(matches!(err, OutboxError::InvalidPayload(_)));
    }

    #[test]
    fn valid_messages_pass() {
        OutboxMessage::Email(email()).validate().unwrap();
        OutboxMessage::Webhook(webhook()).validate().unwrap();
    }

    #[test]
    fn email_validation() {
        let cases = [
            EmailMessage { to: vec![], ..email() },
            EmailMessage { to: vec!["nobody".to_string()], ..email() },
            EmailMessage { subject: "  ".to_string(), ..email() },
            EmailMessage { text_body: None, html_body: Some(String::new()), ..email() },
        ];
        for case in cases {
            let err = OutboxMessage::Email(case).validate().unwrap_err();
            assert!(matches!(err, OutboxError::InvalidPayload(_)));
        }
    }

    #[test]
    fn webhook_validation() {
        let cases = [
            WebhookMessage { url: "not a url".to_string(), ..webhook() },
            WebhookMessage { url: "ftp://example.com/x".to_string(), ..webhook() },
            WebhookMessage { method: "TRACE".to_string(), ..webhook() },
        ];
        for case in cases {
            let err = OutboxMessage::Webhook(case).validate().unwrap_err();
            assert!(matches!(err, OutboxError::InvalidPayload(_)));
        }
    }
}
