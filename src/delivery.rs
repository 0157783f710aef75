use std::{sync::Arc, time::Instant};

use crate::{
    config::Config,
    mail::MailMessage,
    mime_builder,
    mx::MxResolver,
    registry::{JobState, Registry, now_seconds},
    smtp_client::SmtpClient,
};

const SOURCE: &str = "mailer";

#[derive(Clone)]
pub struct DeliveryEngine {
    config: Arc<Config>,
    mx_resolver: MxResolver,
    registry: Arc<Registry>,
}

impl DeliveryEngine {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>) -> Self {
        let mx_resolver = MxResolver::new(config.mail.def_smtp_connect_timeout);
        Self {
            config,
            mx_resolver,
            registry,
        }
    }

    /// Drives delivery for `guid` to completion, updating the registry's state and event
    /// log as it goes. Returns true iff the message was accepted by an MX host.
    pub async fn deliver(&self, guid: &str) -> bool {
        let Some(item) = self.registry.get(guid) else {
            return false;
        };

        let message = item.message.clone();
        let ts_added = item.ts_added;

        let Some(domain) = message.recipient_domain() else {
            self.registry
                .append_event(guid, SOURCE, "cannot get mx servers for: (no domain)");
            self.registry.set_state(guid, JobState::Error);
            return false;
        };

        let mut remaining = self.mx_resolver.resolve(domain).await;
        if remaining.is_empty() {
            self.registry
                .append_event(guid, SOURCE, format!("cannot get mx servers for: {domain}"));
            self.registry.set_state(guid, JobState::Error);
            return false;
        }

        self.registry.append_event(
            guid,
            SOURCE,
            format!("mx servers for target_address: {}", remaining.join(", ")),
        );

        let raw_message = mime_builder::build(&message, ts_added, &self.config);

        let mut delivered = false;
        while !remaining.is_empty() {
            let mx_host = remaining.remove(0);
            self.registry
                .append_event(guid, SOURCE, format!("try mx server for send {mx_host}"));

            let (sent, try_next) = self.try_send(guid, &mx_host, &message, &raw_message).await;

            if sent {
                delivered = true;
                break;
            }

            if now_seconds().saturating_sub(ts_added) > message.send_timeout() {
                self.registry
                    .append_event(guid, SOURCE, "message send timeout reached");
                break;
            }

            if !try_next {
                break;
            }
        }

        if delivered {
            self.registry.set_state(guid, JobState::Sended);
        } else {
            self.registry.append_event(
                guid,
                SOURCE,
                "cannot send message: all mx servers is down or timeout reached",
            );
            self.registry.set_state(guid, JobState::Error);
        }

        delivered
    }

    /// Attempts one MX host. Returns `(sent, try_next)`: `try_next` tells the caller whether
    /// a subsequent host might still succeed.
    async fn try_send(
        &self,
        guid: &str,
        mx_host: &str,
        message: &MailMessage,
        raw_message: &[u8],
    ) -> (bool, bool) {
        let start = Instant::now();
        let proxy = self.config.mail.proxy.as_ref();
        if proxy.is_some() {
            self.registry.append_event(
                guid,
                "smtp",
                "smtp using proxy from configuration for smtp connection",
            );
        }

        let mut client = match SmtpClient::connect(
            proxy,
            mx_host,
            25,
            self.config.mail.def_smtp_connect_timeout,
            &self.config.mail.server_name,
        )
        .await
        {
            Ok(client) => client,
            Err(err) => {
                self.registry.append_event(
                    guid,
                    "smtp",
                    format!("cannot connect to mx server {mx_host}: {err}"),
                );
                return (false, true);
            }
        };

        let (_, capabilities) = match client.ehlo(&self.config.mail.server_name).await {
            Ok(reply) => reply,
            Err(err) => {
                self.registry
                    .append_event(guid, "smtp", format!("EHLO failed on {mx_host}: {err}"));
                return (false, true);
            }
        };

        let supports_starttls = capabilities
            .iter()
            .any(|line| line.eq_ignore_ascii_case("STARTTLS"));

        if supports_starttls {
            match client.starttls(mx_host, message.ignore_starttls_cert()).await {
                Ok((code, text)) => {
                    self.registry
                        .append_event(guid, "smtp", format!("STARTTLS upgraded: {code} {text}"));
                }
                Err(err) => {
                    self.registry.append_event(
                        guid,
                        "smtp",
                        format!("STARTTLS failed on {mx_host}: {err}"),
                    );
                    return (false, true);
                }
            }
        }

        let from_addr = format!("{}@{}", message.from_user(), self.config.mail.domain);
        let failures = match client
            .send_message(&from_addr, &[message.address_to.clone()], raw_message)
            .await
        {
            Ok(failures) => failures,
            Err(err) => {
                self.registry
                    .append_event(guid, "smtp", format!("smtp error sending message: {err}"));
                return (false, true);
            }
        };

        let _ = client.quit().await;

        if failures.is_empty() {
            self.registry.append_event(
                guid,
                "smtp",
                format!(
                    "smtp mail sended successfully in {}s",
                    start.elapsed().as_secs()
                ),
            );
            (true, false)
        } else {
            let failures_json = serde_json::to_string(&failures).unwrap_or_default();
            self.registry.append_event(
                guid,
                "smtp",
                format!("mail have some errors on send: {failures_json}"),
            );
            (false, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{HttpConfig, MailConfig},
        mail::BodyPart,
        registry::RuntimeItem,
    };
    use std::time::Duration;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            mail: MailConfig {
                domain: "example.com".to_string(),
                server_name: "mail.example.com".to_string(),
                def_username: "mailer".to_string(),
                def_smtp_connect_timeout: Duration::from_millis(200),
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
        })
    }

    #[tokio::test]
    async fn deliver_marks_error_when_domain_has_no_mx() {
        let config = test_config();
        let registry = Arc::new(Registry::new());
        let message = MailMessage {
            guid: "job-1".to_string(),
            from_user: Some("mailer".to_string()),
            from_name: Some("Mailer".to_string()),
            address_to: "user@invalid.invalid-tld-that-should-not-resolve".to_string(),
            subject: "hi".to_string(),
            data: vec![BodyPart::Text {
                text: "hi".to_string(),
                subtype: "plain".to_string(),
                charset: "utf-8".to_string(),
            }],
            send_timeout: Some(1),
            ignore_starttls_cert: Some(false),
        };
        registry.insert("job-1".to_string(), RuntimeItem::new(message));

        let engine = DeliveryEngine::new(config, registry.clone());
        let delivered = engine.deliver("job-1").await;

        assert!(!delivered);
        assert_eq!(registry.get("job-1").unwrap().state, JobState::Error);
    }
}
