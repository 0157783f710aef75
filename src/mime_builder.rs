use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use mail_builder::{
    MessageBuilder,
    headers::raw::Raw,
    mime::{BodyPart, MimePart},
};
use tracing::warn;

use crate::{config::Config, dkim::PrivateKey, mail::BodyPart as MailBodyPart, mail::MailMessage};

/// Builds the outbound message bytes for `message`, including a `DKIM-Signature` header
/// when `config.mail.dkim_key_path` is set. Errors during signing are logged and the
/// message is sent unsigned, per the delivery contract.
pub fn build(message: &MailMessage, ts_added: u64, config: &Config) -> Vec<u8> {
    let unsigned = build_unsigned(message, ts_added, config);

    let Some(key_path) = &config.mail.dkim_key_path else {
        return unsigned;
    };

    let sign = || -> Result<String, mail_auth::Error> {
        let key = PrivateKey::load(key_path, &config.mail.domain, &config.mail.dkim_selector)?;
        key.dkim_header(&unsigned)
    };

    match sign() {
        Ok(header_value) => prepend_header(&unsigned, "DKIM-Signature", &header_value),
        Err(err) => {
            warn!("mailer-dkim: {err}");
            unsigned
        }
    }
}

fn build_unsigned(message: &MailMessage, ts_added: u64, config: &Config) -> Vec<u8> {
    let date = DateTime::<Utc>::from_timestamp(ts_added as i64, 0).unwrap_or_else(Utc::now);

    let received = format!(
        "by iaasstore/restmailer via API; id {} for <{}>; {}",
        message.guid,
        message.address_to,
        date.format("%a, %d %b %Y %H:%M:%S %z")
    );

    let mut builder = MessageBuilder::new()
        .message_id(format!("{}@{}", message.guid, config.mail.server_name))
        .date(ts_added as i64)
        .header("Received", Raw::new(received))
        .subject(message.subject.clone())
        .from((message.from_name().to_string(), format!(
            "{}@{}",
            message.from_user(),
            config.mail.domain
        )))
        .to(message.address_to.clone());

    builder = builder.body(build_body(&message.data));

    let mut buf = Vec::new();
    builder
        .write_to(&mut buf)
        .expect("an in-memory MIME write cannot fail");
    buf
}

fn build_body(parts: &[MailBodyPart]) -> MimePart<'static> {
    if let [MailBodyPart::Text { text, subtype, charset }] = parts {
        return text_part(text, subtype, charset);
    }

    let children: Vec<MimePart<'static>> = parts
        .iter()
        .map(|part| match part {
            MailBodyPart::Text { text, subtype, charset } => text_part(text, subtype, charset),
            MailBodyPart::Attachment {
                name,
                content_type,
                content_b64,
            } => attachment_part(name, content_type, content_b64),
        })
        .collect();

    MimePart::new("multipart/mixed", BodyPart::Multipart(children))
}

fn text_part(text: &str, subtype: &str, charset: &str) -> MimePart<'static> {
    let normalized = normalize_crlf(text);
    MimePart::new(
        format!("text/{subtype}; charset=\"{charset}\""),
        BodyPart::Text(normalized.into()),
    )
}

fn attachment_part(name: &str, content_type: &str, content_b64: &str) -> MimePart<'static> {
    let bytes = Base64::decode_vec(content_b64).unwrap_or_default();
    MimePart::new(content_type.to_string(), BodyPart::Binary(bytes.into()))
        .attachment(name.to_string())
}

fn normalize_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\n' {
            out.push('\r');
            out.push('\n');
        } else if c == '\r' {
            out.push('\r');
            if chars.peek() == Some(&'\n') {
                out.push('\n');
                chars.next();
            } else {
                out.push('\n');
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn prepend_header(message: &[u8], name: &str, value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + name.len() + value.len() + 4);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(message);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_crlf_converts_bare_lf() {
        assert_eq!(normalize_crlf("a\nb"), "a\r\nb");
    }

    #[test]
    fn normalize_crlf_is_idempotent_on_existing_crlf() {
        assert_eq!(normalize_crlf("a\r\nb"), "a\r\nb");
    }

    #[test]
    fn prepend_header_places_header_before_body() {
        let message = b"Subject: hi\r\n\r\nbody".to_vec();
        let out = prepend_header(&message, "DKIM-Signature", "v=1");
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("DKIM-Signature: v=1\r\n"));
    }

    #[test]
    fn single_text_part_is_not_wrapped_in_multipart() {
        let parts = vec![MailBodyPart::Text {
            text: "hi".to_string(),
            subtype: "plain".to_string(),
            charset: "utf-8".to_string(),
        }];
        let body = build_body(&parts);
        assert!(matches!(body.contents, BodyPart::Text(_)));
    }

    #[test]
    fn build_emits_required_headers_unsigned() {
        use crate::config::{HttpConfig, MailConfig};
        use std::time::Duration;

        let config = Config {
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
        };

        let message = MailMessage {
            guid: "job-42".to_string(),
            from_user: Some("mailer".to_string()),
            from_name: Some("Mailer".to_string()),
            address_to: "dest@target.com".to_string(),
            subject: "hello".to_string(),
            data: vec![MailBodyPart::Text {
                text: "hi there\nsecond line".to_string(),
                subtype: "plain".to_string(),
                charset: "utf-8".to_string(),
            }],
            send_timeout: Some(30),
            ignore_starttls_cert: Some(false),
        };

        let bytes = build(&message, 1_700_000_000, &config);

        let parsed = mail_parser::MessageParser::default()
            .parse(&bytes)
            .expect("generated message must parse");

        assert_eq!(parsed.subject(), Some("hello"));
        assert_eq!(
            parsed.message_id(),
            Some("job-42@mail.example.com")
        );
        assert!(parsed.header("Received").is_some());
        assert!(parsed.header("DKIM-Signature").is_none());
    }

    #[test]
    fn multiple_parts_are_wrapped_in_multipart_mixed() {
        let parts = vec![
            MailBodyPart::Text {
                text: "hi".to_string(),
                subtype: "plain".to_string(),
                charset: "utf-8".to_string(),
            },
            MailBodyPart::Attachment {
                name: "f.txt".to_string(),
                content_type: "text/plain".to_string(),
                content_b64: "aGVsbG8=".to_string(),
            },
        ];
        let body = build_body(&parts);
        match body.contents {
            BodyPart::Multipart(children) => assert_eq!(children.len(), 2),
            _ => panic!("expected multipart"),
        }
    }
}
