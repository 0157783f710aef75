use std::time::Duration;

use base64ct::{Base64, Encoding};
use fast_socks5::client::{Config as Socks5Config, Socks5Stream};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use crate::config::{ProxyConfig, ProxyScheme};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy dial timed out")]
    Timeout,
    #[error("proxy connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("SOCKS5 proxy error: {0}")]
    Socks5(#[from] fast_socks5::SocksError),
    #[error("HTTP CONNECT through proxy was rejected: {0}")]
    HttpConnectRejected(String),
}

pub type BoxedStream = Box<dyn AsyncReadWrite>;

/// Object-safe union of the traits a boxed socket needs to support.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// Dials `(host, port)` either directly or through the configured proxy, returning a boxed
/// stream so the SMTP client can stay agnostic to what's underneath it. The whole dial,
/// proxy handshake included, is bounded by `timeout`.
pub async fn connect(
    proxy: Option<&ProxyConfig>,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<BoxedStream, ProxyError> {
    let dial = async {
        match proxy {
            None => {
                let stream = TcpStream::connect((host, port)).await?;
                Ok::<BoxedStream, ProxyError>(Box::new(stream))
            }
            Some(proxy) => match proxy.scheme {
                ProxyScheme::Http => connect_http(proxy, host, port).await,
                ProxyScheme::Socks4 => connect_socks4(proxy, host, port).await,
                ProxyScheme::Socks5 => connect_socks5(proxy, host, port).await,
            },
        }
    };

    tokio::time::timeout(timeout, dial)
        .await
        .map_err(|_| ProxyError::Timeout)?
}

async fn connect_http(proxy: &ProxyConfig, host: &str, port: u16) -> Result<BoxedStream, ProxyError> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(username) = &proxy.username {
        let password = proxy.password.as_deref().unwrap_or("");
        let credentials = Base64::encode_string(format!("{username}:{password}").as_bytes());
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(&mut stream);
    let status_line = read_line(&mut reader).await?;
    if !status_line.contains(" 200 ") {
        return Err(ProxyError::HttpConnectRejected(status_line));
    }
    loop {
        let line = read_line(&mut reader).await?;
        if line.is_empty() {
            break;
        }
    }

    Ok(Box::new(stream))
}

async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ProxyError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

async fn connect_socks4(proxy: &ProxyConfig, host: &str, port: u16) -> Result<BoxedStream, ProxyError> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;

    let ip = tokio::net::lookup_host((host, 0))
        .await?
        .find_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "SOCKS4 requires an IPv4 address for the target host",
            ))
        })?;

    let userid = proxy.username.as_deref().unwrap_or("");
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(userid.as_bytes());
    request.push(0x00);

    stream.write_all(&request).await?;

    let mut response = [0u8; 8];
    stream.read_exact(&mut response).await?;
    if response[1] != 0x5a {
        return Err(ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("SOCKS4 proxy rejected connection, code {:#x}", response[1]),
        )));
    }

    Ok(Box::new(stream))
}

async fn connect_socks5(proxy: &ProxyConfig, host: &str, port: u16) -> Result<BoxedStream, ProxyError> {
    let config = Socks5Config::default();
    let stream = match (&proxy.username, &proxy.password) {
        (Some(username), Some(password)) => {
            Socks5Stream::connect_with_password(
                (proxy.host.as_str(), proxy.port),
                host.to_string(),
                port,
                username.clone(),
                password.clone(),
                config,
            )
            .await?
        }
        _ => {
            Socks5Stream::connect(
                (proxy.host.as_str(), proxy.port),
                host.to_string(),
                port,
                config,
            )
            .await?
        }
    };

    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_connect_to_closed_port_fails_fast() {
        let result = connect(None, "127.0.0.1", 1, Duration::from_millis(200)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unreachable_host_times_out() {
        let result = connect(None, "10.255.255.1", 25, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProxyError::Timeout) | Err(ProxyError::Io(_))));
    }
}
