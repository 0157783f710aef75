use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::Config;

fn default_subtype() -> String {
    "plain".to_string()
}

fn default_charset() -> String {
    "utf-8".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BodyPart {
    Text {
        text: String,
        #[serde(default = "default_subtype")]
        subtype: String,
        #[serde(default = "default_charset")]
        charset: String,
    },
    Attachment {
        name: String,
        content_type: String,
        content_b64: String,
    },
}

impl BodyPart {
    pub fn is_text(&self) -> bool {
        matches!(self, BodyPart::Text { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MailMessage {
    #[serde(skip_deserializing)]
    pub guid: String,
    #[serde(default)]
    pub from_user: Option<String>,
    #[serde(default)]
    pub from_name: Option<String>,
    pub address_to: String,
    pub subject: String,
    pub data: Vec<BodyPart>,
    #[serde(default)]
    pub send_timeout: Option<u64>,
    #[serde(default)]
    pub ignore_starttls_cert: Option<bool>,
}

impl MailMessage {
    /// Populate guid and defaulted fields from config. Called once, on ingress.
    pub fn normalize(mut self, guid: String, config: &Config) -> Self {
        self.guid = guid;
        self.from_user = Some(
            self.from_user
                .unwrap_or_else(|| config.mail.def_username.clone()),
        );
        self.from_name = Some(self.from_name.unwrap_or_else(|| {
            capitalize(self.from_user.as_deref().unwrap_or(&config.mail.def_username))
        }));
        self.send_timeout = Some(
            self.send_timeout
                .unwrap_or(config.mail.def_mail_send_timeout.as_secs()),
        );
        self.ignore_starttls_cert = Some(
            self.ignore_starttls_cert
                .unwrap_or(config.mail.def_ignore_starttls_cert),
        );
        self
    }

    pub fn recipient_domain(&self) -> Option<&str> {
        self.address_to.split('@').nth(1)
    }

    pub fn from_user(&self) -> &str {
        self.from_user.as_deref().unwrap_or_default()
    }

    pub fn from_name(&self) -> &str {
        self.from_name.as_deref().unwrap_or_default()
    }

    pub fn send_timeout(&self) -> u64 {
        self.send_timeout.unwrap_or(30)
    }

    pub fn ignore_starttls_cert(&self) -> bool {
        self.ignore_starttls_cert.unwrap_or(false)
    }

    /// A copy with attachment payloads stripped, suitable for client-facing responses.
    pub fn without_attachment_bodies(&self) -> Self {
        let mut copy = self.clone();
        for part in &mut copy.data {
            if let BodyPart::Attachment { content_b64, .. } = part {
                content_b64.clear();
            }
        }
        copy
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        use crate::config::{HttpConfig, MailConfig};
        use std::time::Duration;

        Config {
            mail: MailConfig {
                domain: "example.com".to_string(),
                server_name: "mail.example.com".to_string(),
                def_username: "mailer".to_string(),
                def_smtp_connect_timeout: Duration::from_secs(5),
                def_mail_send_timeout: Duration::from_secs(30),
                def_ignore_starttls_cert: false,
                proxy: None,
                dkim_key_path: None,
                dkim_selector: "mail".to_string(),
            },
            http: HttpConfig {
                listen_host: "0.0.0.0".to_string(),
                listen_port: 8080,
                max_body: 1024,
                runtime_file_path: None,
                auth_tokens: None,
                docs_enabled: true,
            },
        }
    }

    #[test]
    fn normalize_defaults_from_config() {
        let msg = MailMessage {
            guid: String::new(),
            from_user: None,
            from_name: None,
            address_to: "someone@target.com".to_string(),
            subject: "hi".to_string(),
            data: vec![BodyPart::Text {
                text: "hello".to_string(),
                subtype: "plain".to_string(),
                charset: "utf-8".to_string(),
            }],
            send_timeout: None,
            ignore_starttls_cert: None,
        };

        let normalized = msg.normalize("abc-123".to_string(), &test_config());
        assert_eq!(normalized.guid, "abc-123");
        assert_eq!(normalized.from_user(), "mailer");
        assert_eq!(normalized.from_name(), "Mailer");
        assert_eq!(normalized.send_timeout(), 30);
        assert!(!normalized.ignore_starttls_cert());
    }

    #[test]
    fn recipient_domain_splits_on_at() {
        let msg = MailMessage {
            guid: "x".to_string(),
            from_user: Some("a".to_string()),
            from_name: Some("A".to_string()),
            address_to: "jane@example.org".to_string(),
            subject: "s".to_string(),
            data: vec![],
            send_timeout: Some(1),
            ignore_starttls_cert: Some(false),
        };
        assert_eq!(msg.recipient_domain(), Some("example.org"));
    }

    #[test]
    fn without_attachment_bodies_clears_content() {
        let msg = MailMessage {
            guid: "x".to_string(),
            from_user: Some("a".to_string()),
            from_name: Some("A".to_string()),
            address_to: "jane@example.org".to_string(),
            subject: "s".to_string(),
            data: vec![BodyPart::Attachment {
                name: "f.txt".to_string(),
                content_type: "text/plain".to_string(),
                content_b64: "aGVsbG8=".to_string(),
            }],
            send_timeout: Some(1),
            ignore_starttls_cert: Some(false),
        };
        let stripped = msg.without_attachment_bodies();
        match &stripped.data[0] {
            BodyPart::Attachment { content_b64, .. } => assert!(content_b64.is_empty()),
            _ => panic!("expected attachment"),
        }
    }
}
