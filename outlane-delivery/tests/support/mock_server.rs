//! Scripted SMTP peer for delivery tests
//!
//! The server can:
#![allow(dead_code)] // Not every suite uses every knob
//! - answer each command with a configured reply
//! - advertise STARTTLS, accept it, then break the handshake
//! - drop the connection or hang on the Nth command
//! - record every command and message it received
//!
//! # Example
//!
//! ```rust,no_run
//! use support::mock_server::MockSmtpServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_to_response(550, "5.1.1 Mailbox not found")
//!     .build()
//!     .await?;
//!
//! // Point a zone at server.addr() and deliver.
//!
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    StartTls,
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content received after DATA, still dot-stuffed
    MessageContent(Vec<u8>),
    Rset,
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct EhloResponse {
    code: u16,
    capabilities: Vec<String>,
}

impl EhloResponse {
    fn to_bytes(&self) -> Vec<u8> {
        let mut response = String::new();
        let last = self.capabilities.len().saturating_sub(1);

        for (i, cap) in self.capabilities.iter().enumerate() {
            let separator = if i < last { '-' } else { ' ' };
            let _ = write!(&mut response, "{}{separator}{cap}\r\n", self.code);
        }

        response.into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    ehlo_response: EhloResponse,
    helo_response: SmtpResponse,
    starttls_response: SmtpResponse,
    auth_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    data_response: SmtpResponse,
    data_end_response: SmtpResponse,
    quit_response: SmtpResponse,

    // Failure injection
    break_tls: bool,
    drop_after_commands: Option<usize>,
    hang_on_command: Option<usize>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "mx.test ESMTP ready"),
            ehlo_response: EhloResponse {
                code: 250,
                capabilities: vec!["mx.test".to_string(), "SIZE 10485760".to_string()],
            },
            helo_response: SmtpResponse::new(250, "mx.test"),
            starttls_response: SmtpResponse::new(502, "5.5.1 Command not implemented"),
            auth_response: SmtpResponse::new(235, "2.7.0 Authentication successful"),
            mail_from_response: SmtpResponse::new(250, "2.1.0 OK"),
            rcpt_to_response: SmtpResponse::new(250, "2.1.5 OK"),
            data_response: SmtpResponse::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end_response: SmtpResponse::new(250, "2.0.0 OK: queued as 4F2A1"),
            quit_response: SmtpResponse::new(221, "2.0.0 Bye"),
            break_tls: false,
            drop_after_commands: None,
            hang_on_command: None,
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::new()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command received so far, across all connections.
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    /// Message contents received so far.
    pub async fn messages(&self) -> Vec<String> {
        self.commands()
            .await
            .into_iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => {
                    Some(String::from_utf8_lossy(&content).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    /// How many connections were accepted.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    #[allow(clippy::too_many_lines)]
    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut count = 0;

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            line.clear();

            if config.drop_after_commands.is_some_and(|after| count >= after) {
                return Ok(());
            }

            if config.hang_on_command == Some(count) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }

            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }
            count += 1;

            let cmd_line = line.trim();
            let (verb, argument) = cmd_line.split_once(' ').unwrap_or((cmd_line, ""));
            let argument = argument.to_string();

            let (response, command) = match verb.to_uppercase().as_str() {
                "EHLO" => (config.ehlo_response.to_bytes(), SmtpCommand::Ehlo(argument)),
                "HELO" => (config.helo_response.to_bytes(), SmtpCommand::Helo(argument)),
                "STARTTLS" => (config.starttls_response.to_bytes(), SmtpCommand::StartTls),
                "AUTH" => (config.auth_response.to_bytes(), SmtpCommand::Auth(argument)),
                "MAIL" => (
                    config.mail_from_response.to_bytes(),
                    SmtpCommand::MailFrom(argument),
                ),
                "RCPT" => (config.rcpt_to_response.to_bytes(), SmtpCommand::RcptTo(argument)),
                "DATA" => (config.data_response.to_bytes(), SmtpCommand::Data),
                "RSET" => (SmtpResponse::new(250, "2.0.0 OK").to_bytes(), SmtpCommand::Rset),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(&config.quit_response.to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    SmtpResponse::new(500, "5.5.2 Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.to_string()),
                ),
            };

            commands.write().await.push(command.clone());
            writer.write_all(&response).await?;
            writer.flush().await?;

            match command {
                SmtpCommand::StartTls
                    if config.break_tls && config.starttls_response.code == 220 =>
                {
                    // Whatever the client sends next is a ClientHello; answer
                    // with something that is not a TLS record and hang up.
                    writer.write_all(b"this is not a TLS server\r\n").await?;
                    writer.flush().await?;
                    return Ok(());
                }
                SmtpCommand::Data if config.data_response.code == 354 => {
                    let mut content = Vec::new();
                    let mut data_line = String::new();

                    loop {
                        data_line.clear();
                        if reader.read_line(&mut data_line).await? == 0 {
                            return Ok(());
                        }
                        if data_line == ".\r\n" || data_line == ".\n" {
                            break;
                        }
                        content.extend_from_slice(data_line.as_bytes());
                    }

                    commands
                        .write()
                        .await
                        .push(SmtpCommand::MessageContent(content));
                    writer.write_all(&config.data_end_response.to_bytes()).await?;
                    writer.flush().await?;
                }
                _ => {}
            }
        }
    }
}

pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    fn new() -> Self {
        Self {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    /// Set the EHLO reply; the first capability is the server's name.
    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16, capabilities: Vec<String>) -> Self {
        self.config.ehlo_response = EhloResponse { code, capabilities };
        self
    }

    #[must_use]
    pub fn with_helo_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.helo_response = SmtpResponse::new(code, message);
        self
    }

    /// Advertise STARTTLS and answer it with `code`.
    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config
            .ehlo_response
            .capabilities
            .push("STARTTLS".to_string());
        self.config.starttls_response = SmtpResponse::new(code, message);
        self
    }

    /// Advertise and accept STARTTLS, then break the handshake.
    #[must_use]
    pub fn with_broken_starttls(mut self) -> Self {
        self = self.with_starttls_response(220, "2.0.0 Ready to start TLS");
        self.config.break_tls = true;
        self
    }

    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config
            .ehlo_response
            .capabilities
            .push("AUTH PLAIN LOGIN".to_string());
        self.config.auth_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_response = SmtpResponse::new(code, message);
        self
    }

    /// Reply sent after the end-of-data marker.
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// Drop the connection after N commands.
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Stop answering at the Nth command (0-indexed).
    #[must_use]
    pub const fn with_hang_on_command(mut self, index: usize) -> Self {
        self.config.hang_on_command = Some(index);
        self
    }

    /// Binds to a random local port and starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind.
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));

        {
            let commands = Arc::clone(&commands);
            let shutdown = Arc::clone(&shutdown);
            let connections = Arc::clone(&connections);

            tokio::spawn(async move {
                while !shutdown.load(Ordering::Relaxed) {
                    let Ok(Ok((stream, _))) =
                        timeout(Duration::from_millis(100), listener.accept()).await
                    else {
                        continue;
                    };

                    connections.fetch_add(1, Ordering::SeqCst);
                    let config = Arc::clone(&config);
                    let commands = Arc::clone(&commands);
                    tokio::spawn(async move {
                        if let Err(e) = MockSmtpServer::handle_client(stream, config, commands).await {
                            tracing::debug!("Mock server client error: {e}");
                        }
                    });
                }
            });
        }

        Ok(MockSmtpServer {
            addr,
            commands_received: commands,
            shutdown,
            connections,
        })
    }
}
