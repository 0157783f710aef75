use std::{collections::BTreeMap, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        self, ClientConfig, DigitallySignedStruct, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use crate::proxy::{self, BoxedStream, ProxyError};
use crate::config::ProxyConfig;

#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("cannot connect to mx server: {0}")]
    ConnectFailure(#[from] ProxyError),
    #[error("STARTTLS upgrade failed: {0}")]
    TlsFailure(String),
    #[error("SMTP transport error: {0}")]
    TransportFailure(#[from] std::io::Error),
    #[error("SMTP server rejected the command: {0}")]
    Protocol(String),
}

/// Per-recipient failure map as returned by `send_message`: address -> (code, text).
pub type FailureMap = BTreeMap<String, (u16, String)>;

enum Stream {
    Plain(BufReader<BoxedStream>),
    Tls(BufReader<tokio_rustls::client::TlsStream<BoxedStream>>),
}

pub struct SmtpClient {
    stream: Stream,
    local_name: String,
}

impl SmtpClient {
    pub async fn connect(
        proxy: Option<&ProxyConfig>,
        host: &str,
        port: u16,
        timeout: Duration,
        local_name: &str,
    ) -> Result<Self, SmtpError> {
        let socket = proxy::connect(proxy, host, port, timeout).await?;
        let mut client = Self {
            stream: Stream::Plain(BufReader::new(socket)),
            local_name: local_name.to_string(),
        };
        client.read_reply().await?;
        Ok(client)
    }

    pub async fn ehlo(&mut self, name: &str) -> Result<(u16, Vec<String>), SmtpError> {
        self.write_line(&format!("EHLO {name}")).await?;
        let (code, lines) = self.read_multiline_reply().await?;
        Ok((code, lines))
    }

    pub async fn starttls(&mut self, host: &str, ignore_cert: bool) -> Result<(u16, String), SmtpError> {
        self.write_line("STARTTLS").await?;
        let (code, text) = self.read_reply().await?;
        if code != 220 {
            return Err(SmtpError::Protocol(format!("STARTTLS refused: {code} {text}")));
        }

        let plain = match std::mem::replace(&mut self.stream, Stream::Plain(BufReader::new(Box::new(tokio::io::empty())))) {
            Stream::Plain(reader) => reader.into_inner(),
            Stream::Tls(_) => unreachable!("STARTTLS is only issued once, before any TLS upgrade"),
        };

        let config = tls_config(ignore_cert);
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| SmtpError::TlsFailure(e.to_string()))?;

        let tls_stream = connector
            .connect(server_name, plain)
            .await
            .map_err(|e| SmtpError::TlsFailure(e.to_string()))?;

        self.stream = Stream::Tls(BufReader::new(tls_stream));
        Ok((code, text))
    }

    pub async fn send_message(
        &mut self,
        from_addr: &str,
        rcpt: &[String],
        message: &[u8],
    ) -> Result<FailureMap, SmtpError> {
        self.write_line(&format!("MAIL FROM:<{from_addr}>")).await?;
        let (code, text) = self.read_reply().await?;
        if code / 100 != 2 {
            return Err(SmtpError::Protocol(format!("MAIL FROM rejected: {code} {text}")));
        }

        let mut failures = FailureMap::new();
        let mut any_accepted = false;
        for recipient in rcpt {
            self.write_line(&format!("RCPT TO:<{recipient}>")).await?;
            let (code, text) = self.read_reply().await?;
            if code / 100 == 2 {
                any_accepted = true;
            } else {
                failures.insert(recipient.clone(), (code, text));
            }
        }

        if !any_accepted {
            return Ok(failures);
        }

        self.write_line("DATA").await?;
        let (code, text) = self.read_reply().await?;
        if code != 354 {
            return Err(SmtpError::Protocol(format!("DATA rejected: {code} {text}")));
        }

        self.write_dot_stuffed(message).await?;
        let (code, text) = self.read_reply().await?;
        if code / 100 != 2 {
            return Err(SmtpError::Protocol(format!("message body rejected: {code} {text}")));
        }

        Ok(failures)
    }

    pub async fn quit(&mut self) -> Result<(), SmtpError> {
        self.write_line("QUIT").await?;
        let _ = self.read_reply().await;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SmtpError> {
        let data = format!("{line}\r\n");
        match &mut self.stream {
            Stream::Plain(stream) => stream.get_mut().write_all(data.as_bytes()).await?,
            Stream::Tls(stream) => stream.get_mut().write_all(data.as_bytes()).await?,
        }
        Ok(())
    }

    async fn write_dot_stuffed(&mut self, message: &[u8]) -> Result<(), SmtpError> {
        let mut buf = Vec::with_capacity(message.len() + 8);
        for line in message.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.starts_with(b".") {
                buf.push(b'.');
            }
            buf.extend_from_slice(line);
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b".\r\n");
        match &mut self.stream {
            Stream::Plain(stream) => stream.get_mut().write_all(&buf).await?,
            Stream::Tls(stream) => stream.get_mut().write_all(&buf).await?,
        }
        Ok(())
    }

    async fn read_line_raw(&mut self) -> Result<String, SmtpError> {
        let mut line = String::new();
        let n = match &mut self.stream {
            Stream::Plain(stream) => stream.read_line(&mut line).await?,
            Stream::Tls(stream) => stream.read_line(&mut line).await?,
        };
        if n == 0 {
            return Err(SmtpError::TransportFailure(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by remote",
            )));
        }
        Ok(line.trim_end().to_string())
    }

    async fn read_reply(&mut self) -> Result<(u16, String), SmtpError> {
        let (code, lines) = self.read_multiline_reply().await?;
        Ok((code, lines.join(" ")))
    }

    async fn read_multiline_reply(&mut self) -> Result<(u16, Vec<String>), SmtpError> {
        let mut lines = Vec::new();
        let mut code = 0u16;
        loop {
            let line = self.read_line_raw().await?;
            if line.len() < 4 {
                return Err(SmtpError::Protocol(format!("malformed SMTP reply: {line}")));
            }
            code = line[..3]
                .parse()
                .map_err(|_| SmtpError::Protocol(format!("malformed SMTP reply: {line}")))?;
            let separator = line.as_bytes()[3];
            lines.push(line[4..].to_string());
            if separator == b' ' {
                break;
            }
        }
        Ok((code, lines))
    }
}

fn tls_config(ignore_cert: bool) -> ClientConfig {
    if ignore_cert {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Verifier used only when a message explicitly opts out of STARTTLS certificate validation.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffing_escapes_leading_dot_lines() {
        let message = b"Subject: hi\r\n\r\n.starts with dot\r\nnormal line";
        let mut buf = Vec::new();
        for line in message.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.starts_with(b".") {
                buf.push(b'.');
            }
            buf.extend_from_slice(line);
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b".\r\n");
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("..starts with dot\r\n"));
        assert!(text.ends_with(".\r\n"));
    }

    #[test]
    fn tls_config_builds_for_both_modes() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let _ = tls_config(true);
        let _ = tls_config(false);
    }
}
