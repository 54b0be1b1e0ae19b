//! Stage runtime: one listening socket, one thread, one current-thread runtime.

use crate::backend::Backend;
use crate::channel::{ChannelSettings, MessageHandler, handle_connection};
use crate::config::{SocketAddress, StageConfig, StageKind};
use crate::error::Error;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;

/// Counts the connections a stage has admitted and not yet closed.
#[derive(Debug, Default)]
pub struct DrainGate {
    active: Mutex<usize>,
    idle: Condvar,
}

impl DrainGate {
    fn enter(&self) {
        if let Ok(mut active) = self.active.lock() {
            *active += 1;
        }
    }

    fn leave(&self) {
        if let Ok(mut active) = self.active.lock() {
            *active = active.saturating_sub(1);
            if *active == 0 {
                self.idle.notify_all();
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.lock().map_or(0, |active| *active)
    }

    /// Waits up to `timeout` for the count to reach zero, returning whether it did.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let Ok(active) = self.active.lock() else {
            return true;
        };
        match self.idle.wait_timeout_while(active, timeout, |active| *active > 0) {
            Ok((active, _)) => *active == 0,
            Err(_) => true,
        }
    }
}

/// Listening socket bound before the stage thread starts, so bind errors surface at startup.
#[derive(Debug)]
enum BoundSocket {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener, PathBuf),
}

impl BoundSocket {
    fn bind(address: &SocketAddress) -> Result<Self, Error> {
        match address {
            SocketAddress::Tcp { host, port } => {
                let listener = std::net::TcpListener::bind((host.as_str(), *port))?;
                listener.set_nonblocking(true)?;
                Ok(Self::Tcp(listener))
            }
            SocketAddress::Unix(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => log::debug!("Removed stale socket {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                let listener = std::os::unix::net::UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)) {
                    log::warn!("Cannot relax permissions of {}: {e}", path.display());
                }
                Ok(Self::Unix(listener, path.clone()))
            }
        }
    }
}

/// What every connection task of a stage shares.
#[derive(Clone)]
struct Shared {
    settings: Arc<ChannelSettings>,
    handler: Arc<dyn MessageHandler>,
    gate: Arc<DrainGate>,
    closing: watch::Receiver<bool>,
}

impl Shared {
    fn spawn<S>(&self, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        log::debug!("Connection from {peer}");
        self.gate.enter();
        let shared = self.clone();
        tokio::spawn(async move {
            let channel = tokio::spawn(handle_connection(
                stream,
                peer.clone(),
                shared.settings,
                shared.handler,
                shared.closing,
            ));
            match channel.await {
                Ok(Ok(())) => log::debug!("Connection from {peer} closed"),
                Ok(Err(e)) => log::warn!("Connection from {peer} failed: {e}"),
                Err(e) => log::error!("Connection from {peer} aborted: {e}"),
            }
            shared.gate.leave();
        });
    }
}

async fn serve(socket: BoundSocket, shared: Shared, mut stopping: watch::Receiver<bool>) -> Result<(), Error> {
    match socket {
        BoundSocket::Tcp(listener) => {
            let listener = TcpListener::from_std(listener)?;
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => shared.spawn(stream, peer.to_string()),
                        Err(e) => log::warn!("Accept failed: {e}"),
                    },
                    _ = stopping.changed() => break,
                }
            }
        }
        BoundSocket::Unix(listener, path) => {
            let listener = UnixListener::from_std(listener)?;
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => shared.spawn(stream, format!("unix:{}", path.display())),
                        Err(e) => log::warn!("Accept failed: {e}"),
                    },
                    _ = stopping.changed() => break,
                }
            }
            drop(listener);
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Cannot remove socket {}: {e}", path.display());
            }
        }
    }
    Ok(())
}

/// A running stage.
#[derive(Debug)]
pub struct Stage {
    kind: StageKind,
    nowait: bool,
    gate: Arc<DrainGate>,
    closing: watch::Sender<bool>,
    stopping: watch::Sender<bool>,
    exited: mpsc::Receiver<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Stage {
    /// Binds the input endpoint and spawns the stage thread.
    pub fn start(
        config: &StageConfig,
        handler: Arc<dyn MessageHandler>,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, Error> {
        let kind = config.kind;
        let socket = BoundSocket::bind(&config.input.address)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let gate = Arc::new(DrainGate::default());
        let (closing, closing_rx) = watch::channel(false);
        let (stopping, stopping_rx) = watch::channel(false);
        let (exited_tx, exited) = mpsc::channel();

        let shared = Shared {
            settings: Arc::new(ChannelSettings {
                protocol: config.input.protocol,
                hostname: config.hostname.clone(),
                banner: format!(
                    "mail-archiver [{kind}] version {}",
                    env!("CARGO_PKG_VERSION")
                ),
                max_message_size: config.max_message_size,
            }),
            handler,
            gate: gate.clone(),
            closing: closing_rx,
        };

        log::info!("{kind}: listening on {}", config.input);
        let thread = std::thread::Builder::new()
            .name(format!("{kind}-stage"))
            .spawn(move || {
                runtime.block_on(async move {
                    if let Err(e) = serve(socket, shared, stopping_rx).await {
                        log::error!("{kind}: stage failed: {e}");
                    }
                    backend.shutdown().await;
                });
                log::info!("{kind}: stage stopped");
                let _ = exited_tx.send(());
            })?;

        Ok(Self {
            kind,
            nowait: config.nowait,
            gate,
            closing,
            stopping,
            exited,
            thread: Some(thread),
        })
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Waits up to `poll` for the stage thread to exit; `true` if it has.
    pub fn join(&self, poll: Duration) -> bool {
        match self.exited.recv_timeout(poll) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Asks every open connection to close.
    pub fn close_all(&self) {
        self.closing.send_replace(true);
    }

    /// Drains the stage: waits for the open connections unless `force` or
    /// `nowait`, then stops accepting and closes what is left.
    pub fn finish(&self, force: bool) {
        if !force && !self.nowait {
            log::info!("{}: Waiting for {} connections...", self.kind, self.gate.active());
            while !self.gate.wait_idle(Duration::from_secs(1)) {
                if self.thread.as_ref().is_none_or(|t| t.is_finished()) {
                    break;
                }
                log::debug!("{}: {} connections left", self.kind, self.gate.active());
            }
            log::info!("{}: Done", self.kind);
        }
        self.stopping.send_replace(true);
        self.close_all();
    }

    /// Joins the stage thread; call after [`Stage::finish`].
    pub fn close(mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("{}: stage thread panicked", self.kind);
        }
    }
}
