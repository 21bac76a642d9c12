//! SMTP client connection with STARTTLS, AUTH and streamed DATA support.

use std::net::{IpAddr, SocketAddr};

use outlane_common::{incoming, internal, outgoing};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
};

use super::{
    auth::{self, Mechanism},
    data::DotStuffer,
    error::{ClientError, Result},
    response::Response,
    tls,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Size of the chunks message content is streamed in.
const DATA_CHUNK_SIZE: usize = 64 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await?,
            Self::Tls(stream) => stream.flush().await?,
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

    async fn shutdown(&mut self) {
        let _ = match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        };
    }
}

/// Opens a TCP connection to `remote`, originating from `local` when given.
async fn open(remote: SocketAddr, local: Option<IpAddr>) -> Result<TcpStream> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if let Some(local) = local {
        socket.bind(SocketAddr::new(local, 0))?;
    }

    Ok(socket.connect(remote).await?)
}

/// An SMTP client for sending commands and receiving responses.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_name: String,
    accept_invalid_certs: bool,
    transcript: bool,
    extensions: Option<Response>,
}

impl SmtpClient {
    fn from_connection(connection: ClientConnection, server_name: String) -> Self {
        Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_name,
            accept_invalid_certs: true,
            transcript: false,
            extensions: None,
        }
    }

    /// Connects in plaintext to `remote`, binding the local end to `local`
    /// when one is given.
    ///
    /// `server_name` is the hostname used for SNI if the session is later
    /// upgraded with STARTTLS.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the connection fails.
    pub async fn connect(
        remote: SocketAddr,
        local: Option<IpAddr>,
        server_name: impl Into<String>,
    ) -> Result<Self> {
        let stream = open(remote, local).await?;
        Ok(Self::from_connection(
            ClientConnection::Plain(stream),
            server_name.into(),
        ))
    }

    /// Connects to `remote` and immediately performs a TLS handshake
    /// (implicit TLS, e.g. port 465).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    pub async fn connect_tls(
        remote: SocketAddr,
        local: Option<IpAddr>,
        server_name: impl Into<String>,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let server_name = server_name.into();
        let stream = open(remote, local).await?;
        let stream = tls::handshake(stream, &server_name, accept_invalid_certs).await?;

        Ok(Self::from_connection(
            ClientConnection::Tls(Box::new(stream)),
            server_name,
        )
        .accept_invalid_certs(accept_invalid_certs))
    }

    /// Sets whether STARTTLS accepts certificates that fail verification.
    ///
    /// Defaults to `true`, as is usual for opportunistic TLS between MTAs.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Logs every command and reply at INFO instead of TRACE.
    #[must_use]
    pub const fn with_transcript(mut self, transcript: bool) -> Self {
        self.transcript = transcript;
        self
    }

    /// Whether the session is currently protected by TLS.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Whether the last successful EHLO advertised `keyword`.
    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.extensions
            .as_ref()
            .is_some_and(|ehlo| ehlo.has_extension(keyword))
    }

    /// The server this client was created for.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Reads the server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the reply is malformed.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    async fn send_line(&mut self, line: &str, logged: &str) -> Result<()> {
        if self.transcript {
            outgoing!(level = INFO, server = %self.server_name, "{logged}");
        } else {
            outgoing!(server = %self.server_name, "{logged}");
        }

        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;
        connection.send(format!("{line}\r\n").as_bytes()).await?;
        connection.flush().await
    }

    /// Sends a command line and reads the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_line(command, command).await?;
        self.read_response().await
    }

    async fn secret_command(&mut self, command: &str) -> Result<Response> {
        self.send_line(command, "********").await?;
        self.read_response().await
    }

    /// Sends EHLO and remembers the advertised extensions on success.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, name: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {name}")).await?;
        self.extensions = response.is_success().then(|| response.clone());
        Ok(response)
    }

    /// Sends HELO. No extensions are available afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn helo(&mut self, name: &str) -> Result<Response> {
        self.extensions = None;
        self.command(&format!("HELO {name}")).await
    }

    /// Sends STARTTLS and, on a 2xx reply, upgrades the connection.
    ///
    /// A non-2xx reply is returned as-is and the session stays in plaintext.
    /// The advertised extensions are forgotten after an upgrade, so EHLO
    /// must be sent again.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::TlsError`] if the handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;
        if !response.is_success() {
            return Ok(response);
        }

        match self.connection.take() {
            Some(ClientConnection::Plain(stream)) => {
                let stream =
                    tls::handshake(stream, &self.server_name, self.accept_invalid_certs).await?;
                self.connection = Some(ClientConnection::Tls(Box::new(stream)));
                self.buffer_pos = 0;
                self.extensions = None;
                internal!(level = DEBUG, server = %self.server_name, "STARTTLS negotiated");
                Ok(response)
            }
            Some(tls @ ClientConnection::Tls(_)) => {
                self.connection = Some(tls);
                Err(ClientError::TlsError("Connection is already TLS".to_string()))
            }
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Authenticates with `mechanism`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AuthError`] carrying the server reply if the
    /// credentials are refused, or an I/O error.
    pub async fn auth(&mut self, mechanism: Mechanism, user: &str, pass: &str) -> Result<Response> {
        let response = match mechanism {
            Mechanism::Plain => {
                self.send_line(
                    &format!("AUTH PLAIN {}", auth::plain_response(user, pass)),
                    "AUTH PLAIN ********",
                )
                .await?;
                self.read_response().await?
            }
            Mechanism::Login => {
                let mut response = self.command("AUTH LOGIN").await?;
                for secret in [user, pass] {
                    if response.code != 334 {
                        break;
                    }
                    response = self.secret_command(&auth::encode(secret)).await?;
                }
                response
            }
        };

        if response.is_success() {
            Ok(response)
        } else {
            Err(ClientError::AuthError {
                code: response.code,
                message: response.message(),
            })
        }
    }

    /// Sends MAIL FROM, with a SIZE parameter when `size` is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: &str, size: Option<u64>) -> Result<Response> {
        let cmd = match size {
            Some(size) => format!("MAIL FROM:<{from}> SIZE={size}"),
            None => format!("MAIL FROM:<{from}>"),
        };
        self.command(&cmd).await
    }

    /// Sends RCPT TO.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// Sends DATA.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends `data` as message content and reads the final reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_data(&mut self, data: &str) -> Result<Response> {
        self.send_data_stream(data.as_bytes()).await
    }

    /// Streams message content from `reader`, dot-stuffing it on the way,
    /// then sends the end-of-data marker and reads the final reply.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the content or writing to the server fails.
    pub async fn send_data_stream<R>(&mut self, mut reader: R) -> Result<Response>
    where
        R: AsyncRead + Unpin,
    {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;

        let mut stuffer = DotStuffer::new();
        let mut chunk = vec![0u8; DATA_CHUNK_SIZE];
        let mut encoded = Vec::with_capacity(DATA_CHUNK_SIZE + DATA_CHUNK_SIZE / 16);
        let mut total = 0usize;

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            total += n;

            encoded.clear();
            stuffer.encode(&chunk[..n], &mut encoded);
            connection.send(&encoded).await?;
        }

        encoded.clear();
        stuffer.finish(&mut encoded);
        connection.send(&encoded).await?;
        connection.flush().await?;

        outgoing!(server = %self.server_name, bytes = total, "<message content>");

        self.read_response().await
    }

    /// Sends QUIT.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Closes the underlying connection without a QUIT.
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                if self.transcript {
                    incoming!(level = INFO, server = %self.server_name, "{}", response.reply());
                } else {
                    incoming!(server = %self.server_name, "{}", response.reply());
                }

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

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}
