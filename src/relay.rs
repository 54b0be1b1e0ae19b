//! Client side of a stage: forwards a transaction to the next hop.

use crate::channel::Envelope;
use crate::config::{Endpoint, Protocol, SocketAddress, StageConfig};
use crate::error::Error;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpStream, UnixStream};

/// What became of a relayed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Every recipient accepted the message.
    AllOk,
    /// Some recipients refused it, keyed by recipient.
    PartialFailure(BTreeMap<String, (u16, String)>),
    /// The next hop refused the transaction as a whole.
    FullFailure { code: u16, text: String },
    /// The next hop could not be reached or the conversation broke off.
    TransportError(String),
}

/// The server a stage forwards its mail to.
#[async_trait]
pub trait NextHop: Send + Sync + std::fmt::Debug {
    async fn deliver(&self, envelope: &Envelope) -> RelayOutcome;
}

/// Builds the next hop for a stage's `output` endpoint.
pub fn create(config: &StageConfig) -> Arc<dyn NextHop> {
    match config.output.protocol {
        Protocol::Debug => Arc::new(DebugRelay),
        Protocol::Lmtp | Protocol::Smtp => Arc::new(SmtpRelay {
            endpoint: config.output.clone(),
            hostname: config.hostname.clone(),
            timeout: config.timeout,
        }),
    }
}

/// Accepts everything without contacting anybody.
#[derive(Debug)]
pub struct DebugRelay;

#[async_trait]
impl NextHop for DebugRelay {
    async fn deliver(&self, envelope: &Envelope) -> RelayOutcome {
        log::info!(
            "[DebugRelay] sendmail from: <{}> to: {:?} - {} bytes",
            envelope.mail_from,
            envelope.rcpt_to,
            envelope.data.len()
        );
        RelayOutcome::AllOk
    }
}

/// Relays over LMTP or SMTP, on TCP or a unix socket.
#[derive(Debug)]
pub struct SmtpRelay {
    endpoint: Endpoint,
    hostname: String,
    timeout: Option<Duration>,
}

#[derive(Debug)]
struct Reply {
    code: u16,
    /// Every line of the reply, code and separator stripped.
    lines: Vec<String>,
}

impl Reply {
    fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    fn text(&self) -> String {
        self.lines.join(" ")
    }
}

#[derive(Debug, Default)]
struct Extensions {
    eight_bit_mime: bool,
    dsn: bool,
}

impl Extensions {
    fn from_ehlo(reply: &Reply) -> Self {
        let mut extensions = Self::default();
        for line in reply.lines.iter().skip(1) {
            let keyword = line.split_whitespace().next().unwrap_or_default();
            if keyword.eq_ignore_ascii_case("8BITMIME") {
                extensions.eight_bit_mime = true;
            } else if keyword.eq_ignore_ascii_case("DSN") {
                extensions.dsn = true;
            }
        }
        extensions
    }

    /// Keeps the parameters the next hop announced support for.
    fn filter(&self, options: Option<&str>) -> String {
        let Some(options) = options else {
            return String::new();
        };
        options
            .split_whitespace()
            .filter(|option| {
                let key = option.split('=').next().unwrap_or_default().to_uppercase();
                match key.as_str() {
                    "BODY" => self.eight_bit_mime,
                    "RET" | "ENVID" | "NOTIFY" | "ORCPT" => self.dsn,
                    _ => false,
                }
            })
            .fold(String::new(), |mut out, option| {
                out.push(' ');
                out.push_str(option);
                out
            })
    }
}

/// Dot-stuffs the message and normalizes line endings to CRLF.
fn encode_body(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32 + 5);
    let mut lines = data.split(|b| *b == b'\n').peekable();
    while let Some(line) = lines.next() {
        if lines.peek().is_none() && line.is_empty() {
            break;
        }
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

impl SmtpRelay {
    async fn bounded<T, F>(&self, operation: F) -> Result<T, Error>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, operation).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(Error::Io(std::io::ErrorKind::TimedOut.into())),
            },
            None => Ok(operation.await?),
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<RelayOutcome, Error> {
        match &self.endpoint.address {
            SocketAddress::Tcp { host, port } => {
                let stream = self.bounded(TcpStream::connect((host.as_str(), *port))).await?;
                // Disable Nagle's algorithm.
                stream.set_nodelay(true)?;
                self.converse(stream, envelope).await
            }
            SocketAddress::Unix(path) => {
                let stream = self.bounded(UnixStream::connect(path)).await?;
                self.converse(stream, envelope).await
            }
        }
    }

    async fn converse<S>(&self, stream: S, envelope: &Envelope) -> Result<RelayOutcome, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);
        let lmtp = self.endpoint.protocol == Protocol::Lmtp;

        macro_rules! send {
            ($command:expr) => {
                writer.write_all($command).await?;
                writer.flush().await?;
            };
        }
        macro_rules! read {
            () => {
                self.read_reply(&mut reader).await?
            };
        }
        macro_rules! cmd {
            ($command:expr) => {{
                send!(format!("{}\r\n", $command).as_bytes());
                read!()
            }};
        }
        // best effort, the outcome is already known
        macro_rules! quit {
            () => {
                if writer.write_all(b"QUIT\r\n").await.is_ok() && writer.flush().await.is_ok() {
                    let _ = self.read_reply(&mut reader).await;
                }
            };
        }

        let greeting = read!();
        if greeting.code != 220 {
            return Ok(RelayOutcome::TransportError(format!(
                "greeting {} {}",
                greeting.code,
                greeting.text()
            )));
        }

        let extensions = if lmtp {
            let reply = cmd!(format!("LHLO {}", self.hostname));
            if !reply.is_positive() {
                quit!();
                return Ok(refused("LHLO", reply));
            }
            Extensions::from_ehlo(&reply)
        } else {
            let reply = cmd!(format!("EHLO {}", self.hostname));
            if reply.is_positive() {
                Extensions::from_ehlo(&reply)
            } else {
                let reply = cmd!(format!("HELO {}", self.hostname));
                if !reply.is_positive() {
                    quit!();
                    return Ok(refused("HELO", reply));
                }
                Extensions::default()
            }
        };

        let reply = cmd!(format!(
            "MAIL FROM:<{}>{}",
            envelope.mail_from,
            extensions.filter(envelope.mail_options.as_deref())
        ));
        if !reply.is_positive() {
            quit!();
            return Ok(refused("MAIL FROM", reply));
        }

        let mut rejected = BTreeMap::new();
        let mut accepted = Vec::new();
        let mut last_refusal = None;
        for rcpt in &envelope.rcpt_to {
            let options = envelope
                .rcpt_options
                .iter()
                .find(|(address, _)| address == rcpt)
                .and_then(|(_, options)| options.as_deref());
            let reply = cmd!(format!("RCPT TO:<{rcpt}>{}", extensions.filter(options)));
            if reply.is_positive() {
                accepted.push(rcpt.as_str());
            } else {
                log::warn!("Next hop refused recipient {rcpt}: {} {}", reply.code, reply.text());
                rejected.insert(rcpt.clone(), (reply.code, reply.text()));
                last_refusal = Some(reply);
            }
        }
        if accepted.is_empty() {
            quit!();
            return Ok(match last_refusal {
                Some(reply) => refused("RCPT TO", reply),
                None => RelayOutcome::FullFailure {
                    code: 554,
                    text: "No valid recipients".to_string(),
                },
            });
        }

        let reply = cmd!("DATA");
        if reply.code != 354 {
            quit!();
            return Ok(refused("DATA", reply));
        }
        send!(&encode_body(&envelope.data));

        let mut delivered = 0;
        if lmtp {
            for rcpt in accepted {
                let reply = read!();
                if reply.is_positive() {
                    delivered += 1;
                } else {
                    log::warn!("Next hop refused {rcpt} after DATA: {} {}", reply.code, reply.text());
                    rejected.insert(rcpt.to_string(), (reply.code, reply.text()));
                    last_refusal = Some(reply);
                }
            }
        } else {
            let reply = read!();
            if !reply.is_positive() {
                quit!();
                return Ok(refused("end of DATA", reply));
            }
            delivered = accepted.len();
        }
        quit!();

        Ok(match (delivered, last_refusal) {
            (0, Some(reply)) => refused("DATA", reply),
            (_, None) => RelayOutcome::AllOk,
            (_, Some(_)) => RelayOutcome::PartialFailure(rejected),
        })
    }

    /// Reads a possibly multi-line reply.
    async fn read_reply<R>(&self, reader: &mut R) -> Result<Reply, Error>
    where
        R: AsyncBufReadExt + Unpin,
    {
        let mut lines = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.bounded(reader.read_line(&mut line)).await?;
            if n == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            let trimmed = line.trim_end();
            let code = trimmed
                .get(..3)
                .and_then(|code| code.parse::<u16>().ok())
                .ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("malformed reply: {trimmed}"),
                    ))
                })?;
            lines.push(trimmed.get(4..).unwrap_or_default().to_string());
            if trimmed.get(3..4) != Some("-") {
                return Ok(Reply { code, lines });
            }
        }
    }
}

fn refused(stage: &str, reply: Reply) -> RelayOutcome {
    log::warn!("Next hop refused {stage}: {} {}", reply.code, reply.text());
    RelayOutcome::FullFailure {
        code: reply.code,
        text: reply.text(),
    }
}

#[async_trait]
impl NextHop for SmtpRelay {
    async fn deliver(&self, envelope: &Envelope) -> RelayOutcome {
        match self.send(envelope).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Relay to {} failed: {e}", self.endpoint);
                RelayOutcome::TransportError(e.to_string())
            }
        }
    }
}
