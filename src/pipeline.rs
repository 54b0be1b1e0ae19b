//! Per-stage message policy: dedup, header checks, backend call and relay.

use crate::backend::{ArchiveMetadata, Backend, Metadata, StorageMetadata};
use crate::channel::{Envelope, MessageHandler};
use crate::config::{StageConfig, StageKind};
use crate::context::Context;
use crate::dedup::{Claim, DedupStore};
use crate::error::Error;
use crate::message::{
    AID, ArchiveId, MIN_SIZE, attachments, duplicate_header, header_addresses, header_date,
    message_id, remove_header, set_header,
};
use crate::relay::{NextHop, RelayOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use mailparse::{MailHeader, MailHeaderMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// `<code> <dotted extended code> <text>`, the extended code being the digits of `extcode`.
pub fn status_line(code: u16, extcode: u16, text: impl fmt::Display) -> String {
    let dotted = extcode
        .to_string()
        .chars()
        .map(String::from)
        .collect::<Vec<_>>()
        .join(".");
    format!("{code} {dotted} {text}")
}

fn status(code: u16, text: impl fmt::Display) -> String {
    status_line(code, code, text)
}

fn success(text: impl fmt::Display) -> String {
    status_line(250, 200, text)
}

fn timestamp_date(timestamp: i64) -> Option<DateTime<Local>> {
    Local.timestamp_opt(timestamp, 0).single()
}

/// Message handler bound to one stage.
#[derive(Debug)]
pub struct StageHandler {
    kind: StageKind,
    trust_date: bool,
    context: Arc<Context>,
    backend: Arc<dyn Backend>,
    relay: Arc<dyn NextHop>,
    hashdb: Mutex<DedupStore>,
}

impl StageHandler {
    pub fn new(
        config: &StageConfig,
        context: Arc<Context>,
        backend: Arc<dyn Backend>,
        relay: Arc<dyn NextHop>,
    ) -> Result<Self, Error> {
        let hashdb = DedupStore::open(&config.hashdb, config.retention)?;
        log::info!(
            "{}: dedup store {} ({} records)",
            config.kind,
            config.hashdb.display(),
            hashdb.len()
        );
        Ok(Self {
            kind: config.kind,
            trust_date: config.trust_date,
            context,
            backend,
            relay,
            hashdb: Mutex::new(hashdb),
        })
    }

    fn hashdb(&self) -> Result<MutexGuard<'_, DedupStore>, String> {
        self.hashdb.lock().map_err(|_| {
            log::error!("{}: hashdb lock panicked!", self.kind);
            status_line(451, 430, "Internal server error")
        })
    }

    /// Looks the message up, marking it pending when it has no record yet.
    /// A delivery of the same message already in progress is answered with a 4xx.
    fn claim(&self, message_id: &str) -> Result<Dedup<'_>, String> {
        match self.hashdb()?.claim(message_id) {
            Claim::Stored(stored) => Ok(Dedup::Stored(stored)),
            Claim::Pending => {
                log::warn!("{}: {message_id} is already being processed", self.kind);
                Err(status_line(451, 430, "Message is already being processed"))
            }
            Claim::Acquired => Ok(Dedup::Claimed(PendingClaim {
                handler: self,
                message_id: message_id.to_string(),
            })),
        }
    }

    fn remember(&self, message_id: &str, archive_id: &str) {
        let Ok(mut hashdb) = self.hashdb() else {
            return;
        };
        if let Err(e) = hashdb.insert(message_id, archive_id) {
            log::error!("{}: cannot record {message_id} -> {archive_id}: {e}", self.kind);
        }
    }

    fn forget(&self, message_id: &str) {
        let Ok(mut hashdb) = self.hashdb() else {
            return;
        };
        match hashdb.remove(message_id) {
            Ok(true) => log::debug!("{}: dropped record for {message_id}", self.kind),
            Ok(false) => {}
            Err(e) => log::error!("{}: cannot drop record for {message_id}: {e}", self.kind),
        }
    }

    /// Relays the message and turns the outcome into the final reply,
    /// updating the dedup record on the way.
    async fn forward(
        &self,
        envelope: Envelope,
        archive_id: Option<&str>,
        message_id: Option<&str>,
    ) -> String {
        let outcome = self.relay.deliver(&envelope).await;
        let storage = self.kind == StageKind::Storage;
        match outcome {
            RelayOutcome::AllOk => {
                if storage && let Some(mid) = message_id {
                    self.forget(mid);
                }
                match archive_id {
                    Some(aid) => {
                        log::info!("{}: Archived as: {aid}", self.kind);
                        success(format_args!("Archived as: {aid}"))
                    }
                    None => success("Sendmail Ok"),
                }
            }
            RelayOutcome::PartialFailure(rejected) => {
                for (rcpt, (code, text)) in &rejected {
                    log::warn!("{}: {rcpt} rejected by the mailserver: {code} {text}", self.kind);
                }
                if storage && let Some(mid) = message_id {
                    self.forget(mid);
                }
                success("Some of recipients were rejected by the mailserver")
            }
            RelayOutcome::FullFailure { code, text } => {
                log::error!("{}: Sendmail failed: {code} {text}", self.kind);
                if let Some(mid) = message_id {
                    self.forget(mid);
                }
                status(443, "All recipients were rejected by the mailserver")
            }
            RelayOutcome::TransportError(detail) => {
                log::error!("{}: Sendmail failed: {detail}", self.kind);
                status(443, "Failed to connect to output server")
            }
        }
    }

    async fn process_storage(&self, envelope: Envelope) -> Result<String, String> {
        if envelope.data.len() < MIN_SIZE {
            return Err(status(550, "Invalid Mail"));
        }
        let received = Local::now();

        let (header_aid, mid, date) = {
            let headers = parse_headers(&envelope.data, self.kind)?;
            (
                headers.get_first_value(AID),
                message_id(&headers),
                header_date(&headers).and_then(timestamp_date),
            )
        };

        let pending = match self.claim(&mid)? {
            Dedup::Stored(stored) => {
                log::info!("{}: {mid} already stored as {stored}", self.kind);
                return Ok(self.forward(envelope, Some(&stored), Some(&mid)).await);
            }
            Dedup::Claimed(pending) => pending,
        };

        let Some(header_aid) = header_aid else {
            drop(pending);
            log::info!("{}: no {AID}, passing {mid} through", self.kind);
            return Ok(self.forward(envelope, None, Some(&mid)).await);
        };
        let id: ArchiveId = header_aid.parse().map_err(|e| {
            log::warn!("{}: {e}", self.kind);
            status(550, "Invalid X-Archiver-ID header")
        })?;

        let metadata = Metadata::Storage(StorageMetadata {
            data: &envelope.data,
            id,
            date: date.unwrap_or(received),
        });
        let stored = self.backend.process(&metadata).await.map_err(|failure| {
            log::error!("{}: backend failed for {mid}: {failure}", self.kind);
            status(failure.code, failure.message)
        })?;

        let aid = stored.to_string();
        pending.complete(&aid);
        Ok(self.forward(envelope, Some(&aid), Some(&mid)).await)
    }

    async fn process_archive(&self, envelope: Envelope) -> Result<String, String> {
        if envelope.data.len() < MIN_SIZE {
            return Err(status(550, "Invalid Mail"));
        }

        if envelope.mail_from.is_empty() {
            log::info!("{}: Null return path mail, not archived", self.kind);
            let data = remove_header(&envelope.data, AID);
            return Ok(self.forward(Envelope { data, ..envelope }, None, None).await);
        }
        let received = Local::now();

        let headers = parse_headers(&envelope.data, self.kind)?;
        let mid = message_id(&headers);

        let pending = match self.claim(&mid)? {
            Dedup::Stored(stored) => {
                log::info!("{}: {mid} already archived as {stored}", self.kind);
                let data = set_header(&envelope.data, AID, &stored);
                return Ok(self
                    .forward(Envelope { data, ..envelope }, Some(&stored), Some(&mid))
                    .await);
            }
            Dedup::Claimed(pending) => pending,
        };

        if let Some(name) = duplicate_header(&headers) {
            log::warn!("{}: duplicate {name} header in {mid}", self.kind);
            return Err(status(552, "Invalid Syntax in headers"));
        }

        let from = match header_addresses(&headers, "From") {
            Ok(Some(from)) if from.len() > 1 => {
                log::warn!("{}: more than one From address in {mid}", self.kind);
                return Err(status(552, "Invalid From header"));
            }
            Ok(Some(from)) if !from.is_empty() => from,
            Ok(_) => vec![envelope.mail_from.clone()],
            Err(e) => {
                log::warn!("{}: bad From header in {mid}: {e}", self.kind);
                return Err(status(552, "Invalid From header"));
            }
        };
        let to = match header_addresses(&headers, "To") {
            Ok(Some(to)) if !to.is_empty() => to,
            Ok(_) => envelope.rcpt_to.clone(),
            Err(e) => {
                log::warn!("{}: bad To header in {mid}: {e}", self.kind);
                return Err(status(552, "Invalid To header"));
            }
        };
        let cc = header_addresses(&headers, "Cc").unwrap_or_else(|e| {
            log::debug!("{}: ignoring bad Cc header in {mid}: {e}", self.kind);
            None
        });
        let cc = cc.unwrap_or_default();
        let subject = headers.get_first_value("Subject").unwrap_or_default();
        let date = header_date(&headers)
            .and_then(timestamp_date)
            .filter(|_| self.trust_date)
            .unwrap_or(received);

        let tables = self.context.tables();

        let whitelisted = from
            .iter()
            .chain(&to)
            .chain(std::iter::once(&envelope.mail_from))
            .find(|address| tables.is_whitelisted(address));
        if let Some(address) = whitelisted {
            drop(pending);
            log::info!("{}: {address} is whitelisted, not archived", self.kind);
            let data = remove_header(&envelope.data, AID);
            return Ok(self.forward(Envelope { data, ..envelope }, None, None).await);
        }

        let size_kb = (envelope.data.len() >> 10) as u64;
        for address in &from {
            if let Some(limit) = tables.quota(address)
                && limit > 0
                && size_kb > limit
            {
                log::warn!("{}: {address} over quota ({size_kb} > {limit} KB)", self.kind);
                return Err(status(523, "Send quota exceeded"));
            }
        }

        let mailboxes = tables.mailboxes(from.iter().chain(&to).chain(&cc).map(String::as_str));
        let metadata = Metadata::Archive(ArchiveMetadata {
            message_id: mid.clone(),
            from,
            to,
            cc,
            subject,
            date,
            attachments: attachments(&envelope.data),
            mailboxes,
            size: envelope.data.len(),
        });
        log::debug!("{}: archiving {metadata:?}", self.kind);

        let archived = self.backend.process(&metadata).await.map_err(|failure| {
            log::error!("{}: backend failed for {mid}: {failure}", self.kind);
            status(failure.code, failure.message)
        })?;

        let aid = archived.to_string();
        pending.complete(&aid);
        let data = set_header(&envelope.data, AID, &aid);
        Ok(self
            .forward(Envelope { data, ..envelope }, Some(&aid), Some(&mid))
            .await)
    }
}

enum Dedup<'a> {
    Stored(String),
    Claimed(PendingClaim<'a>),
}

/// Pending mark on a message id, released on drop unless completed.
struct PendingClaim<'a> {
    handler: &'a StageHandler,
    message_id: String,
}

impl PendingClaim<'_> {
    /// Records the archive id in place of the pending mark.
    fn complete(self, archive_id: &str) {
        self.handler.remember(&self.message_id, archive_id);
    }
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut hashdb) = self.handler.hashdb() {
            hashdb.release(&self.message_id);
        }
    }
}

fn parse_headers(data: &[u8], kind: StageKind) -> Result<Vec<MailHeader<'_>>, String> {
    match mailparse::parse_headers(data) {
        Ok((headers, _)) => Ok(headers),
        Err(e) => {
            log::warn!("{kind}: cannot parse headers: {e}");
            Err(status(550, "Invalid Mail"))
        }
    }
}

#[async_trait]
impl MessageHandler for StageHandler {
    async fn handle_message(&self, peer: &str, envelope: Envelope) -> Option<String> {
        log::debug!(
            "{}: message from {peer}: <{}> -> {:?}",
            self.kind,
            envelope.mail_from,
            envelope.rcpt_to
        );
        let result = match self.kind {
            StageKind::Archive => self.process_archive(envelope).await,
            StageKind::Storage => self.process_storage(envelope).await,
        };
        Some(result.unwrap_or_else(|reply| reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendFailure;
    use crate::config::Global;
    use crate::context::Tables;
    use rstest::{fixture, rstest};
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    const MAIL: &[u8] = b"From: Alice <alice@example.org>\r\n\
        To: bob@example.org\r\n\
        Subject: Report\r\n\
        Message-ID: <1@example.org>\r\n\
        Date: Fri, 15 Mar 2024 12:00:00 +0000\r\n\
        \r\n\
        Hello Bob\r\n";

    #[derive(Debug, Default)]
    struct FakeBackend {
        calls: Mutex<Vec<String>>,
        dates: Mutex<Vec<DateTime<Local>>>,
        failure: Option<BackendFailure>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn process(&self, metadata: &Metadata<'_>) -> Result<ArchiveId, BackendFailure> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(failure) = &self.failure {
                return Err(failure.clone());
            }
            let mut calls = self.calls.lock().unwrap();
            let (id, call, date) = match metadata {
                Metadata::Archive(archive) => (
                    ArchiveId::new(2024, calls.len() as u64 + 1),
                    archive.message_id.clone(),
                    archive.date,
                ),
                Metadata::Storage(storage) => (storage.id, storage.id.to_string(), storage.date),
            };
            calls.push(call);
            self.dates.lock().unwrap().push(date);
            Ok(id)
        }
    }

    #[derive(Debug, Default)]
    struct ScriptedRelay {
        outcomes: Mutex<VecDeque<RelayOutcome>>,
        sent: Mutex<Vec<Envelope>>,
    }

    impl ScriptedRelay {
        fn push(&self, outcome: RelayOutcome) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        fn last(&self) -> Envelope {
            self.sent.lock().unwrap().last().cloned().unwrap()
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NextHop for ScriptedRelay {
        async fn deliver(&self, envelope: &Envelope) -> RelayOutcome {
            self.sent.lock().unwrap().push(envelope.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(RelayOutcome::AllOk)
        }
    }

    struct Harness {
        handler: StageHandler,
        backend: Arc<FakeBackend>,
        relay: Arc<ScriptedRelay>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(kind: StageKind, backend: FakeBackend, tables: Tables) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let backend = Arc::new(backend);
            let relay = Arc::new(ScriptedRelay::default());
            let handler = StageHandler {
                kind,
                trust_date: true,
                context: Arc::new(Context::with_tables(Global::default(), tables)),
                backend: backend.clone(),
                relay: relay.clone(),
                hashdb: Mutex::new(DedupStore::open(dir.path().join("hashdb.json"), None).unwrap()),
            };
            Self {
                handler,
                backend,
                relay,
                _dir: dir,
            }
        }

        async fn send(&self, sender: &str, data: &[u8]) -> String {
            let envelope = Envelope::new(sender, vec!["bob@example.org".to_string()], data.to_vec());
            self.handler
                .handle_message("127.0.0.1:40000", envelope)
                .await
                .unwrap()
        }

        fn backend_calls(&self) -> usize {
            self.backend.calls.lock().unwrap().len()
        }

        fn archived_date(&self) -> DateTime<Local> {
            *self.backend.dates.lock().unwrap().last().unwrap()
        }

        fn record(&self, mid: &str) -> Option<String> {
            self.handler.hashdb().unwrap().get(mid).map(str::to_string)
        }
    }

    #[fixture]
    fn archive() -> Harness {
        Harness::new(StageKind::Archive, FakeBackend::default(), Tables::default())
    }

    #[fixture]
    fn storage() -> Harness {
        Harness::new(StageKind::Storage, FakeBackend::default(), Tables::default())
    }

    fn relayed_aid(envelope: &Envelope) -> Option<String> {
        let (headers, _) = mailparse::parse_headers(&envelope.data).ok()?;
        headers.get_first_value(AID)
    }

    #[rstest]
    #[case(250, 200, "Ok", "250 2.0.0 Ok")]
    #[case(550, 550, "Invalid Mail", "550 5.5.0 Invalid Mail")]
    #[case(523, 523, "Send quota exceeded", "523 5.2.3 Send quota exceeded")]
    fn test_status_line(
        #[case] code: u16,
        #[case] extcode: u16,
        #[case] text: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(status_line(code, extcode, text), expected);
    }

    #[rstest]
    #[tokio::test]
    async fn test_archive_and_stamp(archive: Harness) {
        let reply = archive.send("alice@example.org", MAIL).await;
        assert_eq!(reply, "250 2.0.0 Archived as: 2024-1");
        assert_eq!(archive.backend_calls(), 1);
        assert_eq!(relayed_aid(&archive.relay.last()).as_deref(), Some("2024-1"));
        assert_eq!(archive.record("<1@example.org>").as_deref(), Some("2024-1"));
    }

    #[rstest]
    #[tokio::test]
    async fn test_replay_is_idempotent(archive: Harness) {
        archive.send("alice@example.org", MAIL).await;
        let reply = archive.send("alice@example.org", MAIL).await;
        assert_eq!(reply, "250 2.0.0 Archived as: 2024-1");
        assert_eq!(archive.backend_calls(), 1);
        assert_eq!(archive.relay.count(), 2);
        assert_eq!(relayed_aid(&archive.relay.last()).as_deref(), Some("2024-1"));
    }

    #[rstest]
    #[tokio::test]
    async fn test_full_failure_rolls_back(archive: Harness) {
        archive.relay.push(RelayOutcome::FullFailure {
            code: 550,
            text: "5.1.1 unknown user".to_string(),
        });
        let reply = archive.send("alice@example.org", MAIL).await;
        assert_eq!(reply, "443 4.4.3 All recipients were rejected by the mailserver");
        assert_eq!(archive.record("<1@example.org>"), None);

        let reply = archive.send("alice@example.org", MAIL).await;
        assert_eq!(reply, "250 2.0.0 Archived as: 2024-2");
        assert_eq!(archive.backend_calls(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_transport_error_keeps_record(archive: Harness) {
        archive
            .relay
            .push(RelayOutcome::TransportError("connection refused".to_string()));
        let reply = archive.send("alice@example.org", MAIL).await;
        assert_eq!(reply, "443 4.4.3 Failed to connect to output server");
        assert_eq!(archive.record("<1@example.org>").as_deref(), Some("2024-1"));

        let reply = archive.send("alice@example.org", MAIL).await;
        assert_eq!(reply, "250 2.0.0 Archived as: 2024-1");
        assert_eq!(archive.backend_calls(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_partial_failure_keeps_record(archive: Harness) {
        archive.relay.push(RelayOutcome::PartialFailure(
            [("carol@example.org".to_string(), (452, "full".to_string()))].into(),
        ));
        let reply = archive.send("alice@example.org", MAIL).await;
        assert_eq!(reply, "250 2.0.0 Some of recipients were rejected by the mailserver");
        assert_eq!(archive.record("<1@example.org>").as_deref(), Some("2024-1"));
    }

    #[rstest]
    #[tokio::test]
    async fn test_duplicate_header_rejected_before_backend(archive: Harness) {
        let mail = [b"Message-ID: <2@example.org>\r\n".as_slice(), MAIL].concat();
        let reply = archive.send("alice@example.org", &mail).await;
        assert_eq!(reply, "552 5.5.2 Invalid Syntax in headers");
        assert_eq!(archive.backend_calls(), 0);
        assert_eq!(archive.relay.count(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_null_sender_strips_archive_id(archive: Harness) {
        let mail = [b"X-Archiver-ID: 2023-9\r\n".as_slice(), MAIL].concat();
        let reply = archive.send("", &mail).await;
        assert_eq!(reply, "250 2.0.0 Sendmail Ok");
        assert_eq!(archive.backend_calls(), 0);
        let relayed = archive.relay.last();
        assert_eq!(relayed.mail_from, "");
        assert_eq!(relayed_aid(&relayed), None);
    }

    #[rstest]
    #[case(b"short".as_slice(), "550 5.5.0 Invalid Mail")]
    #[case(
        b"From: a@example.org, b@example.org\r\nSubject: x\r\n\r\nbody\r\n".as_slice(),
        "552 5.5.2 Invalid From header"
    )]
    #[tokio::test]
    async fn test_rejections(archive: Harness, #[case] mail: &[u8], #[case] expected: &str) {
        assert_eq!(archive.send("alice@example.org", mail).await, expected);
        assert_eq!(archive.backend_calls(), 0);
        assert_eq!(archive.relay.count(), 0);
    }

    #[rstest]
    #[case::from_header("alice", "alice@example.org")]
    #[case::to_header("BOB", "alice@example.org")]
    #[case::envelope_sender("bounces", "bounces@example.org")]
    #[tokio::test]
    async fn test_whitelisted_not_archived(#[case] local_part: &str, #[case] sender: &str) {
        let tables = Tables::new(vec![local_part.to_string()], None, None);
        let archive = Harness::new(StageKind::Archive, FakeBackend::default(), tables);
        for _ in 0..2 {
            assert_eq!(archive.send(sender, MAIL).await, "250 2.0.0 Sendmail Ok");
        }
        assert_eq!(archive.backend_calls(), 0);
        assert_eq!(archive.record("<1@example.org>"), None);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let quota = HashMap::from([("alice".to_string(), 1)]);
        let tables = Tables::new(Vec::new(), Some(quota), None);
        let archive = Harness::new(StageKind::Archive, FakeBackend::default(), tables);

        let mail = [MAIL, &[b'x'; 4096]].concat();
        let reply = archive.send("alice@example.org", &mail).await;
        assert_eq!(reply, "523 5.2.3 Send quota exceeded");
        assert_eq!(archive.backend_calls(), 0);

        // under the limit
        assert_eq!(
            archive.send("alice@example.org", MAIL).await,
            "250 2.0.0 Archived as: 2024-1"
        );
    }

    #[tokio::test]
    async fn test_backend_failure_is_relayed_upstream() {
        let backend = FakeBackend {
            failure: Some(BackendFailure::new(443, "database unavailable")),
            ..FakeBackend::default()
        };
        let archive = Harness::new(StageKind::Archive, backend, Tables::default());
        let reply = archive.send("alice@example.org", MAIL).await;
        assert_eq!(reply, "443 4.4.3 database unavailable");
        assert_eq!(archive.relay.count(), 0);
        assert_eq!(archive.record("<1@example.org>"), None);
        // the retry reaches the backend again
        let reply = archive.send("alice@example.org", MAIL).await;
        assert_eq!(reply, "443 4.4.3 database unavailable");
    }

    #[rstest]
    #[tokio::test]
    async fn test_storage_stores_stamped_mail(storage: Harness) {
        let mail = [b"X-Archiver-ID: 2024-7\r\n".as_slice(), MAIL].concat();
        let reply = storage.send("alice@example.org", &mail).await;
        assert_eq!(reply, "250 2.0.0 Archived as: 2024-7");
        assert_eq!(storage.backend.calls.lock().unwrap().as_slice(), ["2024-7"]);
        // relayed unmodified, cache entry cleared once accepted
        assert_eq!(storage.relay.last().data, mail);
        assert_eq!(storage.record("<1@example.org>"), None);
    }

    #[rstest]
    #[tokio::test]
    async fn test_storage_retry_after_transport_error(storage: Harness) {
        let mail = [b"X-Archiver-ID: 2024-7\r\n".as_slice(), MAIL].concat();
        storage
            .relay
            .push(RelayOutcome::TransportError("timed out".to_string()));
        let reply = storage.send("alice@example.org", &mail).await;
        assert_eq!(reply, "443 4.4.3 Failed to connect to output server");
        assert_eq!(storage.record("<1@example.org>").as_deref(), Some("2024-7"));

        let reply = storage.send("alice@example.org", &mail).await;
        assert_eq!(reply, "250 2.0.0 Archived as: 2024-7");
        assert_eq!(storage.backend_calls(), 1);
        assert_eq!(storage.record("<1@example.org>"), None);
    }

    #[rstest]
    #[tokio::test]
    async fn test_storage_without_archive_id(storage: Harness) {
        let reply = storage.send("alice@example.org", MAIL).await;
        assert_eq!(reply, "250 2.0.0 Sendmail Ok");
        assert_eq!(storage.backend_calls(), 0);
        assert_eq!(storage.relay.last().data, MAIL);
    }

    #[rstest]
    #[tokio::test]
    async fn test_storage_bad_archive_id(storage: Harness) {
        let mail = [b"X-Archiver-ID: yesterday\r\n".as_slice(), MAIL].concat();
        let reply = storage.send("alice@example.org", &mail).await;
        assert_eq!(reply, "550 5.5.0 Invalid X-Archiver-ID header");
        assert_eq!(storage.relay.count(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_archive_stamps_minimal_mail(archive: Harness) {
        let mail = b"Subject: hi\r\nFrom: a@x\r\nTo: b@y\r\nMessage-ID: <1>\r\n\r\nhello";
        let reply = archive.send("a@x", mail).await;
        assert_eq!(reply, "250 2.0.0 Archived as: 2024-1");
        assert_eq!(
            archive.relay.last().data,
            b"Subject: hi\r\nFrom: a@x\r\nTo: b@y\r\nMessage-ID: <1>\r\nX-Archiver-ID: 2024-1\r\n\r\nhello"
        );
    }

    #[rstest]
    #[case::trusted(true)]
    #[case::receive_time(false)]
    #[tokio::test]
    async fn test_archive_date(mut archive: Harness, #[case] trust_date: bool) {
        archive.handler.trust_date = trust_date;
        let before = Local::now();
        archive.send("alice@example.org", MAIL).await;

        let date = archive.archived_date();
        // Fri, 15 Mar 2024 12:00:00 +0000
        if trust_date {
            assert_eq!(date.timestamp(), 1710504000);
        } else {
            assert!(date >= before - chrono::TimeDelta::seconds(1));
        }
    }

    #[rstest]
    #[case(StageKind::Archive, MAIL.to_vec(), "250 2.0.0 Archived as: 2024-1")]
    #[case(
        StageKind::Storage,
        [b"X-Archiver-ID: 2024-7\r\n".as_slice(), MAIL].concat(),
        "250 2.0.0 Archived as: 2024-7"
    )]
    #[tokio::test]
    async fn test_concurrent_duplicates_are_processed_once(
        #[case] kind: StageKind,
        #[case] mail: Vec<u8>,
        #[case] archived: &str,
    ) {
        let backend = FakeBackend {
            delay: Some(Duration::from_millis(100)),
            ..FakeBackend::default()
        };
        let stage = Harness::new(kind, backend, Tables::default());

        let (first, second) = tokio::join!(
            stage.send("alice@example.org", &mail),
            stage.send("alice@example.org", &mail)
        );
        assert_eq!(first, archived);
        assert_eq!(second, "451 4.3.0 Message is already being processed");
        assert_eq!(stage.backend_calls(), 1);
        assert_eq!(stage.relay.count(), 1);
    }
}
