//! Per-community storage lifecycle.
//!
//! A [`StorageFacade`] binds one community to its three core logs (channel
//! directory, certificates, thread directory) and to one log per known
//! channel and thread. It is owned by a single task; log listeners only
//! enqueue [`StorageSignal`]s which that task feeds back through
//! [`StorageFacade::handle_signal`].
//!
//! ```text
//! Uninitialized -> Initializing -> Ready -> ShuttingDown -> Closed
//!                       |
//!                       +--(core log failure)--> Uninitialized
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use murmur_shared::constants::{
    CERTIFICATES_LOG, CHANNEL_DIRECTORY_LOG, CHANNEL_LOAD_TIMEOUT_MS, CORE_LOAD_TIMEOUT_MS,
    THREAD_DIRECTORY_LOG,
};
use murmur_shared::crypto::CryptoProvider;
use murmur_shared::error::ValidationError;
use murmur_shared::types::{
    thread_log_name, ChannelAddress, ChannelMessage, Conversation, PublicChannel, UserRecord,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::certificates::CertificateRegistry;
use crate::channels::ChannelRegistry;
use crate::error::{Result, StoreError};
use crate::events::{forward_to, EventSink, LogSource, SignalSender, StorageSignal};
use crate::gate::{CertificateGate, MessageGate};
use crate::log::{AccessPolicy, AppendOutcome, LogEvent, LogHandle, LogOpener, Substrate};
use crate::threads::DirectMessageRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Closed,
}

/// Options of one community's storage.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Community directory; created on start when `create_paths` is set.
    pub data_dir: Option<PathBuf>,
    pub create_paths: bool,
    pub core_load_timeout: Duration,
    pub channel_load_timeout: Duration,
    /// Community root certificate (PEM). Gates the certificate log when set.
    pub root_certificate: Option<String>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            create_paths: true,
            core_load_timeout: Duration::from_millis(CORE_LOAD_TIMEOUT_MS),
            channel_load_timeout: Duration::from_millis(CHANNEL_LOAD_TIMEOUT_MS),
            root_certificate: None,
        }
    }
}

struct Registries {
    channels: ChannelRegistry,
    certificates: CertificateRegistry,
    threads: DirectMessageRegistry,
}

impl Registries {
    /// Every open log, channel and thread logs first.
    fn all_logs(&self) -> Vec<Arc<dyn LogHandle>> {
        let mut logs = self.channels.logs();
        logs.extend(self.threads.logs());
        logs.push(self.channels.directory().log().clone());
        logs.push(self.certificates.log().clone());
        logs.push(self.threads.directory().log().clone());
        logs
    }
}

pub struct StorageFacade {
    community_id: String,
    substrate: Arc<dyn Substrate>,
    crypto: Arc<dyn CryptoProvider>,
    options: StorageOptions,
    state: Lifecycle,
    registries: Option<Registries>,
    pending_channels: HashSet<ChannelAddress>,
    pending_threads: HashSet<String>,
    signals_tx: SignalSender,
    signals_rx: mpsc::UnboundedReceiver<StorageSignal>,
    events: EventSink,
}

impl StorageFacade {
    pub fn new(
        community_id: impl Into<String>,
        substrate: Arc<dyn Substrate>,
        crypto: Arc<dyn CryptoProvider>,
        options: StorageOptions,
        events: EventSink,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            community_id: community_id.into(),
            substrate,
            crypto,
            options,
            state: Lifecycle::Uninitialized,
            registries: None,
            pending_channels: HashSet::new(),
            pending_threads: HashSet::new(),
            signals_tx,
            signals_rx,
            events,
        }
    }

    pub fn community_id(&self) -> &str {
        &self.community_id
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Channel and thread init tasks that have not reported yet.
    pub fn pending_inits(&self) -> usize {
        self.pending_channels.len() + self.pending_threads.len()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the core logs, enter `Ready` and fan out channel/thread opens.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != Lifecycle::Uninitialized {
            return Err(StoreError::InvalidState(format!(
                "start called while {:?}",
                self.state
            )));
        }
        self.state = Lifecycle::Initializing;
        info!(community = %self.community_id, "starting storage");

        if self.options.create_paths {
            if let Some(dir) = &self.options.data_dir {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    self.state = Lifecycle::Uninitialized;
                    error!(dir = %dir.display(), error = %e, "failed to create community directory");
                    return Err(e.into());
                }
            }
        }

        let mut opened = Vec::new();
        let registries = match self.open_core(&mut opened).await {
            Ok(registries) => registries,
            Err(e) => {
                error!(community = %self.community_id, error = %e, "failed to open core logs");
                for log in opened {
                    if let Err(close_err) = log.close().await {
                        warn!(log = log.name(), error = %close_err, "failed to close core log");
                    }
                }
                self.state = Lifecycle::Uninitialized;
                return Err(e);
            }
        };
        self.registries = Some(registries);
        self.state = Lifecycle::Ready;
        info!(community = %self.community_id, "storage ready");

        self.fan_out();
        Ok(())
    }

    /// `start()`, then wait for every fanned-out init task.
    pub async fn init(&mut self) -> Result<()> {
        self.start().await?;
        self.settle().await;
        Ok(())
    }

    async fn open_core(&self, opened: &mut Vec<Arc<dyn LogHandle>>) -> Result<Registries> {
        let timeout = self.options.core_load_timeout;

        let directory = self
            .substrate
            .open_map(CHANNEL_DIRECTORY_LOG, AccessPolicy::Open)
            .await?;
        opened.push(directory.log().clone());
        directory
            .log()
            .on(forward_to(&self.signals_tx, LogSource::ChannelDirectory));
        directory.log().load(timeout).await?;
        info!(log = CHANNEL_DIRECTORY_LOG, "core log 1/3 opened");

        let certificate_policy = match &self.options.root_certificate {
            Some(root) => AccessPolicy::Gated(Arc::new(CertificateGate::new(
                self.crypto.clone(),
                root.clone(),
            ))),
            None => AccessPolicy::Open,
        };
        let certificates = self
            .substrate
            .open_log(CERTIFICATES_LOG, certificate_policy)
            .await?;
        opened.push(certificates.clone());
        certificates.on(forward_to(&self.signals_tx, LogSource::Certificates));
        certificates.load(timeout).await?;
        info!(log = CERTIFICATES_LOG, "core log 2/3 opened");

        let thread_directory = self
            .substrate
            .open_map(THREAD_DIRECTORY_LOG, AccessPolicy::Open)
            .await?;
        opened.push(thread_directory.log().clone());
        thread_directory
            .log()
            .on(forward_to(&self.signals_tx, LogSource::ThreadDirectory));
        thread_directory.log().load(timeout).await?;
        info!(log = THREAD_DIRECTORY_LOG, "core log 3/3 opened");

        let channel_opener = LogOpener::new(
            self.substrate.clone(),
            AccessPolicy::Gated(Arc::new(MessageGate::new(self.crypto.clone()))),
            self.options.channel_load_timeout,
        );
        let thread_opener = LogOpener::new(
            self.substrate.clone(),
            AccessPolicy::Open,
            self.options.channel_load_timeout,
        );

        Ok(Registries {
            channels: ChannelRegistry::new(
                directory,
                channel_opener,
                self.signals_tx.clone(),
                self.events.clone(),
            ),
            certificates: CertificateRegistry::new(
                certificates,
                self.crypto.clone(),
                self.events.clone(),
            ),
            threads: DirectMessageRegistry::new(
                thread_directory,
                thread_opener,
                self.signals_tx.clone(),
                self.events.clone(),
            ),
        })
    }

    fn fan_out(&mut self) {
        let Some(registries) = &self.registries else {
            return;
        };
        let channels = registries.channels.unopened();
        let threads = registries.threads.unopened();
        debug!(
            channels = channels.len(),
            threads = threads.len(),
            "initializing known channels and threads"
        );

        for address in channels {
            self.spawn_channel_init(address);
        }
        for address in threads {
            self.spawn_thread_init(address);
        }
    }

    fn spawn_channel_init(&mut self, address: ChannelAddress) {
        let Some(registries) = &self.registries else {
            return;
        };
        if !self.pending_channels.insert(address.clone()) {
            return;
        }
        let opener = registries.channels.opener().clone();
        let signals = self.signals_tx.clone();
        tokio::spawn(async move {
            let result = opener.open(&address.log_name()).await;
            let _ = signals.send(StorageSignal::ChannelOpened { address, result });
        });
    }

    fn spawn_thread_init(&mut self, address: String) {
        let Some(registries) = &self.registries else {
            return;
        };
        if !self.pending_threads.insert(address.clone()) {
            return;
        }
        let opener = registries.threads.opener().clone();
        let signals = self.signals_tx.clone();
        tokio::spawn(async move {
            let result = opener.open(&thread_log_name(&address)).await;
            let _ = signals.send(StorageSignal::ThreadOpened { address, result });
        });
    }

    /// Wait until every pending init task has reported.
    pub async fn settle(&mut self) {
        while self.pending_inits() > 0 {
            match self.signals_rx.recv().await {
                Some(signal) => self.handle_signal(signal),
                None => break,
            }
        }
        self.pump();
    }

    /// Handle every signal queued so far. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(signal) = self.signals_rx.try_recv() {
            self.handle_signal(signal);
            handled += 1;
        }
        handled
    }

    /// Next queued signal, for an owning task that multiplexes other input.
    pub async fn next_signal(&mut self) -> Option<StorageSignal> {
        self.signals_rx.recv().await
    }

    /// Close every log and the substrate. Never fails.
    pub async fn stop_all(&mut self) {
        if self.state == Lifecycle::Closed {
            debug!(community = %self.community_id, "storage already closed");
            return;
        }
        self.state = Lifecycle::ShuttingDown;
        info!(community = %self.community_id, "stopping storage");

        if let Some(registries) = self.registries.take() {
            for log in registries.all_logs() {
                if let Err(e) = log.close().await {
                    warn!(log = log.name(), error = %e, "failed to close log");
                }
            }
        }
        if let Err(e) = self.substrate.stop().await {
            warn!(error = %e, "failed to stop substrate");
        }

        self.pending_channels.clear();
        self.pending_threads.clear();
        self.state = Lifecycle::Closed;
        info!(community = %self.community_id, "storage closed");
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    pub fn handle_signal(&mut self, signal: StorageSignal) {
        match signal {
            StorageSignal::Log { source, event } => self.handle_log_event(source, event),
            StorageSignal::ChannelOpened { address, result } => {
                self.pending_channels.remove(&address);
                let Some(registries) = self.ready_registries() else {
                    debug!(channel = %address, "discarding channel init result");
                    return;
                };
                match result {
                    Ok(log) => registries.channels.adopt(address, log),
                    Err(e) => warn!(channel = %address, error = %e, "channel failed to initialize"),
                }
            }
            StorageSignal::ThreadOpened { address, result } => {
                self.pending_threads.remove(&address);
                let Some(registries) = self.ready_registries() else {
                    debug!(thread = %address, "discarding thread init result");
                    return;
                };
                match result {
                    Ok(log) => registries.threads.adopt(address, log),
                    Err(e) => warn!(thread = %address, error = %e, "thread failed to initialize"),
                }
            }
        }
    }

    fn handle_log_event(&mut self, source: LogSource, event: LogEvent) {
        let Some(registries) = self.ready_registries() else {
            return;
        };
        match source {
            LogSource::ChannelDirectory => {
                for address in registries.channels.handle_directory_event(event) {
                    self.spawn_channel_init(address);
                }
            }
            LogSource::Certificates => registries.certificates.handle_event(event),
            LogSource::ThreadDirectory => {
                for address in registries.threads.handle_directory_event(event) {
                    self.spawn_thread_init(address);
                }
            }
            LogSource::Channel(address) => registries.channels.handle_channel_event(&address, event),
            LogSource::Thread(address) => registries.threads.handle_thread_event(&address, event),
        }
    }

    fn ready_registries(&mut self) -> Option<&mut Registries> {
        match self.state {
            Lifecycle::Ready => self.registries.as_mut(),
            _ => None,
        }
    }

    fn registries(&self) -> Result<&Registries> {
        match (&self.registries, self.state) {
            (Some(registries), Lifecycle::Ready) => Ok(registries),
            _ => Err(StoreError::NotReady(self.state)),
        }
    }

    fn registries_mut(&mut self) -> Result<&mut Registries> {
        match (&mut self.registries, self.state) {
            (Some(registries), Lifecycle::Ready) => Ok(registries),
            (_, state) => Err(StoreError::NotReady(state)),
        }
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    pub async fn create_channel(&mut self, channel: &PublicChannel) -> Result<()> {
        self.registries_mut()?
            .channels
            .create_or_get(channel)
            .await
            .map(|_| ())
    }

    pub async fn subscribe_to_channel(&mut self, channel: &PublicChannel) -> Result<()> {
        self.registries_mut()?.channels.subscribe(channel).await
    }

    pub async fn send_message(&mut self, message: &ChannelMessage) -> Result<AppendOutcome> {
        self.registries_mut()?.channels.send(message).await
    }

    pub fn ask_for_messages(&self, address: &str, ids: &[String]) -> Result<Vec<ChannelMessage>> {
        Ok(self.registries()?.channels.ask_for_messages(address, ids))
    }

    pub fn load_all_messages(&self, address: &str) -> Result<Vec<ChannelMessage>> {
        self.registries()?.channels.load_all_messages(address)
    }

    pub fn message_ids(&self, address: &str) -> Result<Vec<String>> {
        let address = ChannelAddress::parse(address)?;
        Ok(self.registries()?.channels.message_ids(&address))
    }

    pub fn channels(&self) -> Result<Vec<PublicChannel>> {
        Ok(self.registries()?.channels.channels())
    }

    // ------------------------------------------------------------------
    // Certificates
    // ------------------------------------------------------------------

    /// Admit a certificate, verified against `root` or the configured root.
    pub async fn save_certificate(&mut self, certificate: &str, root: Option<&str>) -> Result<bool> {
        let root = root
            .map(str::to_string)
            .or_else(|| self.options.root_certificate.clone())
            .ok_or(ValidationError::MissingField("rootCertificate"))?;
        self.registries()?.certificates.admit(certificate, &root).await
    }

    pub fn username_exists(&self, name: &str) -> Result<bool> {
        Ok(self.registries()?.certificates.username_exists(name))
    }

    pub fn users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.registries()?.certificates.users())
    }

    pub fn certificates(&self) -> Result<Vec<String>> {
        Ok(self.registries()?.certificates.certificates())
    }

    // ------------------------------------------------------------------
    // Direct messages
    // ------------------------------------------------------------------

    pub async fn initialize_conversation(&mut self, address: &str, encrypted_phrase: &str) -> Result<()> {
        self.registries_mut()?
            .threads
            .initialize_conversation(address, encrypted_phrase)
            .await
    }

    pub async fn subscribe_to_thread(&mut self, address: &str) -> Result<()> {
        self.registries_mut()?.threads.subscribe_thread(address).await
    }

    pub async fn subscribe_to_all_conversations(&mut self, addresses: &[String]) -> Result<()> {
        self.registries_mut()?.threads.subscribe_all(addresses).await;
        Ok(())
    }

    pub async fn send_direct_message(&mut self, address: &str, message: &str) -> Result<()> {
        self.registries_mut()?
            .threads
            .send_direct_message(address, message)
            .await
    }

    pub fn private_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.registries()?.threads.private_conversations())
    }

    pub fn direct_messages(&self, address: &str) -> Result<Vec<String>> {
        Ok(self.registries()?.threads.messages(address))
    }
}
