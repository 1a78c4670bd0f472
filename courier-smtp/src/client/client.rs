//! SMTP client connection with support for implicit TLS and STARTTLS.

use std::{future::Future, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::{incoming, outgoing, tracing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

use super::{
    capabilities::AuthMechanism,
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        match self {
            Self::Plain(stream) => Ok(Self::Tls(Box::new(
                handshake(stream, domain, accept_invalid_certs).await?,
            ))),
            Self::Tls(_) => Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            )),
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        };
    }
}

fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
    }
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

async fn handshake(
    stream: TcpStream,
    domain: &str,
    accept_invalid_certs: bool,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

    tls_connector(accept_invalid_certs)?
        .connect(server_name, stream)
        .await
        .map_err(|e| ClientError::TlsError(e.to_string()))
}

/// A certificate verifier that accepts all certificates (for testing only).
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Races `future` against `after`, turning an elapsed deadline into a
/// [`ClientError::Timeout`] tagged with `stage`.
async fn with_timeout<T>(
    stage: &'static str,
    after: Duration,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, future)
        .await
        .map_err(|_| ClientError::Timeout { stage, after })?
}

/// Applies SMTP transparency (RFC 5321 4.5.2) and appends the end-of-data
/// marker.
fn encode_data(data: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);

    for line in data.split_inclusive('\n') {
        if line.starts_with('.') {
            out.push(b'.');
        }
        if let Some(body) = line.strip_suffix('\n') {
            out.extend_from_slice(body.strip_suffix('\r').unwrap_or(body).as_bytes());
            out.extend_from_slice(b"\r\n");
        } else {
            out.extend_from_slice(line.as_bytes());
        }
    }

    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// An SMTP client for sending commands and receiving responses.
///
/// Every read and write is bounded by the socket timeout given at connect
/// time.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    last_response: Option<Response>,
    server_domain: String,
    accept_invalid_certs: bool,
    socket_timeout: Duration,
}

impl SmtpClient {
    /// Opens a plaintext connection to `addr`.
    ///
    /// `server_domain` is used for TLS SNI and certificate validation should
    /// the connection later be upgraded with STARTTLS.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Resolve`] if the host cannot be resolved,
    /// [`ClientError::Timeout`] if no connection is established within
    /// `connect_timeout`, or the I/O error of the last address tried.
    pub async fn connect(
        addr: &str,
        server_domain: String,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let stream = with_timeout("connect", connect_timeout, open_stream(addr)).await?;

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            last_response: None,
            server_domain,
            accept_invalid_certs: false,
            socket_timeout: Duration::from_secs(60),
        })
    }

    /// Opens a connection that speaks TLS from the first byte (port 465).
    ///
    /// The TLS handshake counts towards `connect_timeout`.
    ///
    /// # Errors
    ///
    /// As [`SmtpClient::connect`], plus [`ClientError::TlsError`] if the
    /// handshake fails.
    pub async fn connect_tls(
        addr: &str,
        server_domain: String,
        connect_timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let stream = with_timeout("connect", connect_timeout, async {
            let stream = open_stream(addr).await?;
            handshake(stream, &server_domain, accept_invalid_certs).await
        })
        .await?;

        Ok(Self {
            connection: Some(ClientConnection::Tls(Box::new(stream))),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            last_response: None,
            server_domain,
            accept_invalid_certs,
            socket_timeout: Duration::from_secs(60),
        })
    }

    /// Sets whether to accept invalid TLS certificates on STARTTLS.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Sets the per-read and per-write socket timeout.
    #[must_use]
    pub const fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Whether the connection is currently TLS protected.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Reads the initial server greeting, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting does not arrive in
    /// time.
    pub async fn read_greeting(&mut self, timeout: Duration) -> Result<Response> {
        with_timeout("greeting", timeout, self.read_response()).await
    }

    /// Sends a command to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("{command}");
        self.write_line(command).await
    }

    /// Like [`SmtpClient::command`], but traces `shown` in place of the
    /// credential-bearing line.
    async fn secret_command(&mut self, shown: &str, command: &str) -> Result<Response> {
        outgoing!("{shown}");
        self.write_line(command).await?;
        self.read_response().await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let data = format!("{line}\r\n");
        self.write(data.as_bytes()).await
    }

    /// Sends a raw command and reads the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    /// Authenticates with `mechanism`.
    ///
    /// Returns the final reply, which is `235` on success. Any reply other
    /// than the expected `334` challenge ends the exchange early.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails at the transport level.
    pub async fn auth(
        &mut self,
        mechanism: AuthMechanism,
        username: &str,
        password: &str,
    ) -> Result<Response> {
        match mechanism {
            AuthMechanism::Plain => {
                let token = STANDARD.encode(format!("\0{username}\0{password}"));
                self.secret_command("AUTH PLAIN <redacted>", &format!("AUTH PLAIN {token}"))
                    .await
            }
            AuthMechanism::Login => {
                let response = self.command("AUTH LOGIN").await?;
                if response.code != 334 {
                    return Ok(response);
                }

                let response = self
                    .secret_command("<redacted>", &STANDARD.encode(username))
                    .await?;
                if response.code != 334 {
                    return Ok(response);
                }

                self.secret_command("<redacted>", &STANDARD.encode(password))
                    .await
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> Result<Response> {
        let cmd = if let Some(sz) = size {
            format!("MAIL FROM:<{from}> SIZE={sz}")
        } else {
            format!("MAIL FROM:<{from}>")
        };
        self.command(&cmd).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the message content, dot-stuffed, followed by the end-of-data
    /// marker, and reads the relay's verdict.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_data(&mut self, data: &str) -> Result<Response> {
        self.write(&encode_data(data)).await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn noop(&mut self) -> Result<Response> {
        self.command("NOOP").await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Shuts the socket down and drops the connection.
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }

    /// Sends STARTTLS and upgrades the connection when the relay agrees.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS fails or TLS upgrade fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let domain = self.server_domain.clone();
            let accept_invalid = self.accept_invalid_certs;

            let Some(old_connection) = self.connection.take() else {
                return Err(ClientError::ConnectionClosed);
            };
            // Anything buffered before the handshake came over plaintext.
            self.buffer_pos = 0;
            let upgraded = with_timeout(
                "tls handshake",
                self.socket_timeout,
                old_connection.upgrade_to_tls(&domain, accept_invalid),
            )
            .await?;
            self.connection = Some(upgraded);
        }

        Ok(response)
    }

    /// Returns the last response received, if any.
    #[must_use]
    pub const fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let after = self.socket_timeout;
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;
        with_timeout("socket", after, connection.send(data)).await
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{response}");
                self.last_response = Some(response.clone());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let after = self.socket_timeout;
            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = with_timeout(
                "socket",
                after,
                connection.read(&mut self.buffer[self.buffer_pos..]),
            )
            .await?;
            self.buffer_pos += n;
        }
    }
}

/// Resolves `addr` and connects to the first address that accepts.
async fn open_stream(addr: &str) -> Result<TcpStream> {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    let addresses = tokio::net::lookup_host(addr)
        .await
        .map_err(|source| ClientError::Resolve {
            host: host.to_string(),
            source,
        })?;

    let mut last_error = None;
    for address in addresses {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%address, error = %e, "Connection attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.map_or_else(
        || ClientError::Resolve {
            host: host.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses returned",
            ),
        },
        ClientError::Io,
    ))
}
