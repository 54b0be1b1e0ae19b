//! LMTP/SMTP protocol engine: one channel per accepted connection.

use crate::address::{parse_envelope_address, tokenize};
use crate::config::Protocol;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::watch;

const OK_250: &str = "250 2.0.0 Ok";
const INTERNAL_ERROR_451: &str = "451 4.3.0 Internal server error";
const LINE_TOO_LONG_500: &str = "500 5.5.2 Line too long";

/// Longest command line accepted, CRLF included.
const MAX_LINE: usize = 1000;

/// Represents an SMTP envelope with sender, recipients, and raw message data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Reverse path, empty for the null sender.
    pub mail_from: String,
    pub mail_options: Option<String>,
    pub rcpt_to: Vec<String>,
    /// Per-recipient parameters (DSN `NOTIFY=`, `ORCPT=`), kept for pass-through.
    pub rcpt_options: Vec<(String, Option<String>)>,
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn new(mail_from: impl Into<String>, rcpt_to: Vec<String>, data: Vec<u8>) -> Self {
        Self {
            mail_from: mail_from.into(),
            rcpt_to,
            data,
            ..Default::default()
        }
    }
}

/// Receives every completed transaction of a channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes the message; `None` means a generic `250` reply.
    async fn handle_message(&self, peer: &str, envelope: Envelope) -> Option<String>;
}

/// Per-stage settings every channel of that stage shares.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub protocol: Protocol,
    pub hostname: String,
    pub banner: String,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Lhlo,
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Bdat,
    Unknown(String),
}

impl Command {
    fn from_verb(verb: String) -> Self {
        match verb.as_str() {
            "LHLO" => Command::Lhlo,
            "HELO" => Command::Helo,
            "EHLO" => Command::Ehlo,
            "MAIL" => Command::Mail,
            "RCPT" => Command::Rcpt,
            "DATA" => Command::Data,
            "RSET" => Command::Rset,
            "NOOP" => Command::Noop,
            "QUIT" => Command::Quit,
            "BDAT" => Command::Bdat,
            _ => Command::Unknown(verb),
        }
    }

    fn verb(&self) -> &str {
        match self {
            Command::Lhlo => "LHLO",
            Command::Helo => "HELO",
            Command::Ehlo => "EHLO",
            Command::Mail => "MAIL",
            Command::Rcpt => "RCPT",
            Command::Data => "DATA",
            Command::Rset => "RSET",
            Command::Noop => "NOOP",
            Command::Quit => "QUIT",
            Command::Bdat => "BDAT",
            Command::Unknown(verb) => verb,
        }
    }
}

/// What the connection loop must do after a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Reply(String),
    /// Reply, then read the message body.
    Data(String),
    /// Reply, then close the connection.
    Close(String),
}

/// Command state of one connection.
#[derive(Debug)]
struct Session {
    settings: Arc<ChannelSettings>,
    greeting: Option<String>,
    transaction: Option<Envelope>,
}

impl Session {
    fn new(settings: Arc<ChannelSettings>) -> Self {
        Self {
            settings,
            greeting: None,
            transaction: None,
        }
    }

    fn command(&mut self, line: &str) -> Step {
        if line.is_empty() {
            return Step::Reply("500 5.5.2 Error: bad syntax".to_string());
        }
        let (verb, arg) = tokenize(line);
        let arg = arg.filter(|a| !a.is_empty());
        let command = Command::from_verb(verb);

        match (self.settings.protocol, &command) {
            (Protocol::Lmtp, Command::Lhlo)
            | (Protocol::Smtp, Command::Helo)
            | (Protocol::Smtp, Command::Ehlo) => Step::Reply(self.hello(&command, arg)),
            (_, Command::Mail) => Step::Reply(self.mail(arg)),
            (_, Command::Rcpt) => Step::Reply(self.rcpt(arg)),
            (_, Command::Data) => self.data(arg),
            (_, Command::Rset) => {
                self.transaction = None;
                Step::Reply(OK_250.to_string())
            }
            (_, Command::Noop) => match arg {
                Some(_) => Step::Reply("500 5.5.2 Syntax: NOOP".to_string()),
                None => Step::Reply(OK_250.to_string()),
            },
            (_, Command::Quit) => Step::Close("221 2.0.0 Bye".to_string()),
            (_, Command::Bdat) => Step::Reply("502 5.5.1 BDAT not implemented".to_string()),
            (_, command) => Step::Reply(format!(
                "502 5.5.1 Error: command \"{}\" not implemented",
                command.verb()
            )),
        }
    }

    fn hello(&mut self, command: &Command, arg: Option<&str>) -> String {
        let verb = command.verb();
        let Some(arg) = arg else {
            return format!("500 5.5.2 Syntax: {verb} hostname");
        };
        if self.greeting.is_some() {
            return format!("501 5.5.1 Duplicate {verb}");
        }
        self.greeting = Some(arg.to_string());

        let host = &self.settings.hostname;
        match command {
            Command::Helo => format!("250 {host}"),
            Command::Ehlo => format!(
                "250-{host}\r\n250-8BITMIME\r\n250-ENHANCEDSTATUSCODES\r\n250-PIPELINING\r\n250 DSN"
            ),
            _ => format!("250-{host}\r\n250-8BITMIME\r\n250-ENHANCEDSTATUSCODES\r\n250 PIPELINING"),
        }
    }

    fn mail(&mut self, arg: Option<&str>) -> String {
        let parsed = match parse_envelope_address("FROM:", arg.unwrap_or_default()) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("Invalid MAIL argument: {e}");
                return "500 5.5.2 Syntax: MAIL FROM:<address> [ SP <mail-parameters> ]"
                    .to_string();
            }
        };
        if self.transaction.is_some() {
            return "503 5.5.1 Error: nested MAIL command".to_string();
        }

        let eight_bit = parsed.options.as_deref().is_some_and(|options| {
            options
                .split_whitespace()
                .any(|option| option.eq_ignore_ascii_case("BODY=8BITMIME"))
        });
        self.transaction = Some(Envelope {
            mail_options: parsed.options,
            ..Envelope::new(parsed.address, Vec::new(), Vec::new())
        });

        if eight_bit {
            "250 2.0.0 Ok - Body 8bitmime ok".to_string()
        } else {
            OK_250.to_string()
        }
    }

    fn rcpt(&mut self, arg: Option<&str>) -> String {
        let Some(transaction) = self.transaction.as_mut() else {
            return "503 5.5.1 Error: need MAIL command".to_string();
        };
        match parse_envelope_address("TO:", arg.unwrap_or_default()) {
            Ok(parsed) if !parsed.address.is_empty() => {
                transaction.rcpt_to.push(parsed.address.clone());
                transaction.rcpt_options.push((parsed.address, parsed.options));
                OK_250.to_string()
            }
            result => {
                if let Err(e) = result {
                    log::debug!("Invalid RCPT argument: {e}");
                }
                "500 5.5.2 Syntax: RCPT TO: <address> [ SP <rcpt-parameters> ]".to_string()
            }
        }
    }

    fn data(&mut self, arg: Option<&str>) -> Step {
        if !self
            .transaction
            .as_ref()
            .is_some_and(|t| !t.rcpt_to.is_empty())
        {
            return Step::Reply("503 5.5.1 Error: need RCPT command".to_string());
        }
        if arg.is_some() {
            return Step::Reply("500 5.5.2 Syntax: DATA".to_string());
        }
        Step::Data("354 End data with <CR><LF>.<CR><LF>".to_string())
    }

    /// Hands out the transaction of a completed DATA phase and resets the state.
    fn take_transaction(&mut self, data: Vec<u8>) -> Option<Envelope> {
        let mut envelope = self.transaction.take()?;
        envelope.data = data;
        Some(envelope)
    }
}

/// Outcome of reading one command line.
enum Line {
    Read,
    TooLong,
    Eof,
}

/// Reads one command line of at most [`MAX_LINE`] bytes. The rest of a
/// longer line is read and discarded.
async fn read_command<R>(reader: &mut R, line: &mut Vec<u8>) -> std::io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_LINE as u64;
    if (&mut *reader).take(limit).read_until(b'\n', line).await? == 0 {
        return Ok(Line::Eof);
    }
    if line.ends_with(b"\n") || line.len() < MAX_LINE {
        return Ok(Line::Read);
    }

    let mut rest = Vec::new();
    loop {
        rest.clear();
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut rest).await?;
        if n == 0 || rest.ends_with(b"\n") {
            return Ok(Line::TooLong);
        }
    }
}

/// Outcome of reading one DATA phase.
enum Body {
    Complete(Vec<u8>),
    TooLarge,
    Eof,
}

/// Reads lines until CRLF "." CRLF, undoing the dot transparency.
async fn read_body<R>(reader: &mut R, max_size: usize) -> std::io::Result<Body>
where
    R: AsyncBufRead + Unpin,
{
    // a line longer than this overflows the size limit on its own
    let limit = max_size.saturating_add(3) as u64;
    let mut data = Vec::new();
    let mut line = Vec::new();
    let mut too_large = false;
    let mut line_end = true;

    loop {
        line.clear();
        if (&mut *reader).take(limit).read_until(b'\n', &mut line).await? == 0 {
            return Ok(Body::Eof);
        }
        let line_start = std::mem::replace(&mut line_end, line.ends_with(b"\n"));
        if line_start && line == b".\r\n" {
            break;
        }
        if !line_end {
            too_large = true;
        }
        if too_large {
            continue;
        }

        // RFC 821, Section 4.5.2
        let text = match line_start {
            true => line.strip_prefix(b".").unwrap_or(&line),
            false => line.as_slice(),
        };
        data.extend_from_slice(text);

        if data.len() > max_size {
            too_large = true;
            data = Vec::new();
        }
    }

    Ok(if too_large {
        Body::TooLarge
    } else {
        Body::Complete(data)
    })
}

async fn push<W>(writer: &mut W, reply: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    log::debug!("Sent: {reply}");
    writer.write_all(reply.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

/// Runs one channel until the peer quits, disconnects or `closing` fires.
pub async fn handle_connection<S>(
    stream: S,
    peer: String,
    settings: Arc<ChannelSettings>,
    handler: Arc<dyn MessageHandler>,
    mut closing: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut session = Session::new(settings.clone());

    push(
        &mut writer,
        &format!("220 {} {}", settings.hostname, settings.banner),
    )
    .await?;

    'connection: loop {
        if *closing.borrow() {
            log::debug!("Closing connection from {peer}");
            break 'connection;
        }

        line.clear();
        let read = tokio::select! {
            read = read_command(&mut reader, &mut line) => read?,
            _ = closing.changed() => {
                log::debug!("Closing connection from {peer}");
                break 'connection;
            }
        };
        match read {
            Line::Read => {}
            Line::TooLong => {
                log::warn!("Command line too long from {peer}");
                push(&mut writer, LINE_TOO_LONG_500).await?;
                continue 'connection;
            }
            Line::Eof => break 'connection,
        }

        let Some(cmd) = line.strip_suffix(b"\r\n") else {
            log::warn!("Malformed command without CRLF ending from {peer}! Closing connection.");
            break 'connection;
        };
        let cmd = String::from_utf8_lossy(cmd);
        log::debug!("Received: {cmd}");

        match session.command(&cmd) {
            Step::Reply(reply) => push(&mut writer, &reply).await?,
            Step::Close(reply) => {
                push(&mut writer, &reply).await?;
                break 'connection;
            }
            Step::Data(reply) => {
                push(&mut writer, &reply).await?;
                let data = match read_body(&mut reader, settings.max_message_size).await? {
                    Body::Complete(data) => data,
                    Body::TooLarge => {
                        session.transaction = None;
                        push(&mut writer, "552 5.3.4 Message exceeds maximum size").await?;
                        continue 'connection;
                    }
                    Body::Eof => break 'connection,
                };
                let Some(envelope) = session.take_transaction(data) else {
                    push(&mut writer, "451 4.3.0 Internal confusion").await?;
                    continue 'connection;
                };

                let status = deliver(&peer, handler.clone(), envelope).await;
                push(&mut writer, &status).await?;
            }
        }
    }

    writer.shutdown().await.ok();
    Ok(())
}

/// Invokes the handler, answering a generic error if it panics.
async fn deliver(peer: &str, handler: Arc<dyn MessageHandler>, envelope: Envelope) -> String {
    let task_peer = peer.to_string();
    let task = tokio::spawn(async move { handler.handle_message(&task_peer, envelope).await });
    match task.await {
        Ok(status) => status.unwrap_or_else(|| OK_250.to_string()),
        Err(e) => {
            log::error!("Message handler failed for {peer}: {e}");
            INTERNAL_ERROR_451.to_string()
        }
    }
}
