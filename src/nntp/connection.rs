//! Single NNTP session: connect, authenticate, POST, STAT, QUIT
//!
//! One connection drives one strictly sequential command conversation.
//! Every socket read and write is guarded by the configured operation
//! deadline; expiry surfaces as a connection error and the engine decides
//! whether to reconnect.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsConnector;

use crate::config::ServerConfig;
use crate::error::NntpError;
use crate::post::Article;

/// How establishing a session failed.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The server rejected our credentials; reconnecting will not help.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Resolution, connect, TLS, greeting or transport failure.
    #[error(transparent)]
    Fatal(#[from] NntpError),
}

/// Final classification of one POST exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    /// 2xx to the article body.
    Success,
    /// 4xx to the initial POST command; this server will not take posts.
    NotPermitted,
    /// Non-2xx to the article body; the status line is kept for logging.
    Rejected(String),
    /// I/O failure or deadline expiry anywhere in the exchange.
    ConnectionError,
}

/// Final classification of one STAT exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatOutcome {
    /// 2xx: the article is present on the server.
    Exists,
    /// Any other response: the article is not retrievable.
    Missing,
    /// I/O failure or deadline expiry.
    ConnectionError,
}

/// An authenticated NNTP session over TCP or TLS.
pub struct NntpConnection {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
    op_timeout: Duration,
}

impl NntpConnection {
    /// Connect, optionally handshake TLS, check the greeting and
    /// authenticate with AUTHINFO USER/PASS.
    pub async fn connect(
        server: &ServerConfig,
        op_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let addr = (server.host.as_str(), server.port);

        let tcp_stream = timeout(op_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NntpError::Timeout {
                seconds: op_timeout.as_secs(),
            })?
            .map_err(|e| NntpError::ConnectionFailed {
                server: server.host.clone(),
                port: server.port,
                source: e,
            })?;

        tcp_stream.set_nodelay(true).map_err(NntpError::from_io)?;

        let (reader, writer): (
            Box<dyn AsyncRead + Unpin + Send>,
            Box<dyn AsyncWrite + Unpin + Send>,
        ) = if server.tls {
            let mut builder = native_tls::TlsConnector::builder();
            if !server.verify_certs {
                // TODO: make certificate verification the default and
                // require an explicit opt-out in the server section.
                builder.danger_accept_invalid_certs(true);
                builder.danger_accept_invalid_hostnames(true);
            }
            let connector = builder
                .build()
                .map_err(|e| NntpError::TlsError(e.to_string()))?;
            let connector = Arc::new(TlsConnector::from(connector));

            let tls_stream = timeout(op_timeout, connector.connect(&server.host, tcp_stream))
                .await
                .map_err(|_| NntpError::Timeout {
                    seconds: op_timeout.as_secs(),
                })?
                .map_err(|e| NntpError::TlsError(e.to_string()))?;

            let (read_half, write_half) = tokio::io::split(tls_stream);
            (Box::new(read_half), Box::new(write_half))
        } else {
            let (read_half, write_half) = tokio::io::split(tcp_stream);
            (Box::new(read_half), Box::new(write_half))
        };

        let mut conn = Self {
            writer,
            reader: BufReader::new(reader),
            op_timeout,
        };

        let greeting = conn.read_response().await?;
        if !leading_digit_is(&greeting, b'2') {
            return Err(NntpError::Greeting(greeting).into());
        }

        conn.authenticate(server).await?;
        Ok(conn)
    }

    async fn authenticate(&mut self, server: &ServerConfig) -> Result<(), ConnectError> {
        self.send_command(&format!("AUTHINFO USER {}", server.username))
            .await?;
        let mut response = self.read_response().await?;

        if response.starts_with("381") {
            self.send_command(&format!("AUTHINFO PASS {}", server.password))
                .await?;
            response = self.read_response().await?;
        }

        if leading_digit_is(&response, b'2') {
            Ok(())
        } else {
            // Keep only the status code; the full line may echo account data.
            let code = response.split_whitespace().next().unwrap_or("").to_string();
            Err(ConnectError::InvalidCredentials(code))
        }
    }

    /// Run one POST exchange. The article is borrowed so a failed post can
    /// be re-sent unchanged or re-minted by the caller.
    pub async fn post(&mut self, article: &Article) -> PostOutcome {
        match self.try_post(article).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!("post transport failure: {e}");
                PostOutcome::ConnectionError
            }
        }
    }

    async fn try_post(&mut self, article: &Article) -> Result<PostOutcome, NntpError> {
        self.send_command("POST").await?;
        let prompt = self.read_response().await?;
        if leading_digit_is(&prompt, b'4') {
            return Ok(PostOutcome::NotPermitted);
        }

        let mut head = Vec::with_capacity(512);
        article.header().write_to(&mut head);
        head.extend_from_slice(b"\r\n");
        self.write_all(&head).await?;
        for chunk in article.payload() {
            self.write_all(chunk).await?;
        }
        self.write_all(b"\r\n.\r\n").await?;
        self.flush().await?;

        let response = self.read_response().await?;
        if leading_digit_is(&response, b'2') {
            Ok(PostOutcome::Success)
        } else {
            tracing::warn!("post rejected, server responded: {response}");
            Ok(PostOutcome::Rejected(response))
        }
    }

    /// Run one STAT exchange for a message-id (angle brackets included).
    pub async fn stat(&mut self, message_id: &str) -> StatOutcome {
        match self.try_stat(message_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!("stat transport failure: {e}");
                StatOutcome::ConnectionError
            }
        }
    }

    async fn try_stat(&mut self, message_id: &str) -> Result<StatOutcome, NntpError> {
        self.send_command(&format!("STAT {message_id}")).await?;
        let response = self.read_response().await?;
        if leading_digit_is(&response, b'2') {
            Ok(StatOutcome::Exists)
        } else {
            Ok(StatOutcome::Missing)
        }
    }

    /// Graceful teardown: QUIT, best-effort goodbye, socket shutdown.
    pub async fn quit(mut self) {
        let _ = self.send_command("QUIT").await;
        let _ = timeout(Duration::from_secs(2), self.read_response_inner()).await;
        let _ = self.writer.shutdown().await;
    }

    /// Immediate teardown without the QUIT exchange.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }

    async fn send_command(&mut self, command: &str) -> Result<(), NntpError> {
        let mut line = Vec::with_capacity(command.len() + 2);
        line.extend_from_slice(command.as_bytes());
        line.extend_from_slice(b"\r\n");
        self.write_all(&line).await?;
        self.flush().await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), NntpError> {
        timeout(self.op_timeout, self.writer.write_all(data))
            .await
            .map_err(|_| NntpError::Timeout {
                seconds: self.op_timeout.as_secs(),
            })?
            .map_err(NntpError::from_io)
    }

    async fn flush(&mut self) -> Result<(), NntpError> {
        timeout(self.op_timeout, self.writer.flush())
            .await
            .map_err(|_| NntpError::Timeout {
                seconds: self.op_timeout.as_secs(),
            })?
            .map_err(NntpError::from_io)
    }

    async fn read_response(&mut self) -> Result<String, NntpError> {
        timeout(self.op_timeout, self.read_response_inner())
            .await
            .map_err(|_| NntpError::Timeout {
                seconds: self.op_timeout.as_secs(),
            })?
    }

    async fn read_response_inner(&mut self) -> Result<String, NntpError> {
        let mut response = String::new();
        let n = self
            .reader
            .read_line(&mut response)
            .await
            .map_err(NntpError::from_io)?;
        if n == 0 {
            return Err(NntpError::Protocol("connection closed by server".into()));
        }

        while response.ends_with('\n') || response.ends_with('\r') {
            response.pop();
        }
        Ok(response)
    }
}

fn leading_digit_is(line: &str, digit: u8) -> bool {
    line.as_bytes().first() == Some(&digit)
}
