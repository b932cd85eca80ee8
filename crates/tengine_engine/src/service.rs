use crate::activity::DEFAULT_SWEEP_INTERVAL;
use crate::engine::{
    DownloadRequest, EngineChannels, EngineEvent, SyncRequest, TransferEngine, UploadRequest,
};
use crate::error::EngineError;
use serde_json::{Map, Value};
use std::time::Duration;
use tengine_plugins::{PluginInfoResult, UploadEvent};
use tengine_transfer::{PluginDescriptor, Transfer, TransferId, TransferStatus, UploadContent};
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_IDLE_EXIT: Duration = Duration::from_secs(5);

const COMMAND_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub sweep_interval: Duration,
    /// Stop once this long passes without a call while nothing is
    /// outstanding. `None` keeps the service alive until shut down.
    pub idle_exit: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_exit: Some(DEFAULT_IDLE_EXIT),
        }
    }
}

enum EngineCommand {
    UploadMediaItem(UploadRequest, Reply<TransferId>),
    UploadContent {
        content: UploadContent,
        plugin_id: String,
        user_data: Map<String, Value>,
        reply: Reply<TransferId>,
    },
    CreateDownload(DownloadRequest, Reply<TransferId>),
    CreateSync(SyncRequest, Reply<TransferId>),
    Start(TransferId, Reply<()>),
    Restart(TransferId, Reply<()>),
    Cancel(TransferId, Reply<()>),
    Finish {
        transfer_id: TransferId,
        status: TransferStatus,
        reason: String,
        reply: Reply<()>,
    },
    UpdateProgress(TransferId, f64, Reply<()>),
    Transfers(Reply<Vec<Transfer>>),
    TransferMethods(Reply<Vec<PluginDescriptor>>),
    ClearTransfers(Reply<u64>),
    EnableNotifications(bool, Reply<()>),
    NotificationsEnabled(Reply<bool>),
    PluginsChanged,
    ExitIfIdle,
    Shutdown(oneshot::Sender<()>),
}

impl EngineCommand {
    /// Calls from clients keep the service alive; internal signals do not.
    fn is_public(&self) -> bool {
        !matches!(self, Self::PluginsChanged | Self::ExitIfIdle | Self::Shutdown(_))
    }
}

/// Cloneable front door to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Resolves once the engine task stops taking commands.
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    pub async fn upload_media_item(&self, request: UploadRequest) -> Result<TransferId, EngineError> {
        self.call(|reply| EngineCommand::UploadMediaItem(request, reply)).await
    }

    pub async fn upload_content(
        &self,
        content: UploadContent,
        plugin_id: String,
        user_data: Map<String, Value>,
    ) -> Result<TransferId, EngineError> {
        self.call(|reply| EngineCommand::UploadContent {
            content,
            plugin_id,
            user_data,
            reply,
        })
        .await
    }

    pub async fn create_download(&self, request: DownloadRequest) -> Result<TransferId, EngineError> {
        self.call(|reply| EngineCommand::CreateDownload(request, reply)).await
    }

    pub async fn create_sync(&self, request: SyncRequest) -> Result<TransferId, EngineError> {
        self.call(|reply| EngineCommand::CreateSync(request, reply)).await
    }

    pub async fn start_transfer(&self, transfer_id: TransferId) -> Result<(), EngineError> {
        self.call(|reply| EngineCommand::Start(transfer_id, reply)).await
    }

    pub async fn restart_transfer(&self, transfer_id: TransferId) -> Result<(), EngineError> {
        self.call(|reply| EngineCommand::Restart(transfer_id, reply)).await
    }

    pub async fn cancel_transfer(&self, transfer_id: TransferId) -> Result<(), EngineError> {
        self.call(|reply| EngineCommand::Cancel(transfer_id, reply)).await
    }

    pub async fn finish_transfer(
        &self,
        transfer_id: TransferId,
        status: TransferStatus,
        reason: String,
    ) -> Result<(), EngineError> {
        self.call(|reply| EngineCommand::Finish {
            transfer_id,
            status,
            reason,
            reply,
        })
        .await
    }

    pub async fn update_transfer_progress(&self, transfer_id: TransferId, progress: f64) -> Result<(), EngineError> {
        self.call(|reply| EngineCommand::UpdateProgress(transfer_id, progress, reply))
            .await
    }

    pub async fn transfers(&self) -> Result<Vec<Transfer>, EngineError> {
        self.call(EngineCommand::Transfers).await
    }

    pub async fn transfer_methods(&self) -> Result<Vec<PluginDescriptor>, EngineError> {
        self.call(EngineCommand::TransferMethods).await
    }

    pub async fn clear_transfers(&self) -> Result<u64, EngineError> {
        self.call(EngineCommand::ClearTransfers).await
    }

    pub async fn enable_notifications(&self, enabled: bool) -> Result<(), EngineError> {
        self.call(|reply| EngineCommand::EnableNotifications(enabled, reply))
            .await
    }

    pub async fn notifications_enabled(&self) -> Result<bool, EngineError> {
        self.call(EngineCommand::NotificationsEnabled).await
    }

    /// Plugin directory or account change; triggers a debounced rescan.
    pub fn plugins_changed(&self) {
        let _ = self.commands.try_send(EngineCommand::PluginsChanged);
    }

    /// Stops the service right away if nothing is outstanding.
    pub async fn exit_if_idle(&self) {
        let _ = self.commands.send(EngineCommand::ExitIfIdle).await;
    }

    /// Stops the service and waits for the shutdown recovery pass.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(EngineCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> EngineCommand) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }
}

/// Runs a [`TransferEngine`] on its own task. Commands, capability reports,
/// plugin answers and timers are all serialized through one `select!` loop.
pub struct EngineService {
    engine: TransferEngine,
    commands: mpsc::Receiver<EngineCommand>,
    upload_events: mpsc::UnboundedReceiver<UploadEvent>,
    plugin_infos: mpsc::UnboundedReceiver<PluginInfoResult>,
    config: ServiceConfig,
}

impl EngineService {
    pub fn spawn(
        engine: TransferEngine,
        channels: EngineChannels,
        config: ServiceConfig,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let handle = EngineHandle {
            commands: commands_tx,
            events: engine.event_sender(),
        };
        let service = Self {
            engine,
            commands,
            upload_events: channels.upload_events,
            plugin_infos: channels.plugin_infos,
            config,
        };
        (handle, tokio::spawn(service.run()))
    }

    async fn run(mut self) {
        if let Err(err) = self.engine.recover().await {
            error!(error = %err, "startup recovery failed");
        }
        self.engine.discover_plugins();

        let sweep_every = self.config.sweep_interval;
        let mut sweep = time::interval_at(Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut idle_at = self.config.idle_exit.map(|grace| Instant::now() + grace);
        let mut shutdown_reply = None;

        info!("transfer engine running");
        loop {
            let rescan_at = self.engine.plugin_rescan_deadline();
            select! {
                biased;

                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if command.is_public() {
                        idle_at = self.config.idle_exit.map(|grace| Instant::now() + grace);
                    }
                    match command {
                        EngineCommand::Shutdown(reply) => {
                            shutdown_reply = Some(reply);
                            break;
                        }
                        EngineCommand::ExitIfIdle => {
                            if !self.engine.has_outstanding() {
                                info!("exit requested while idle");
                                break;
                            }
                            debug!("exit requested with transfers outstanding, ignoring");
                        }
                        command => self.handle_command(command).await,
                    }
                }
                Some(event) = self.upload_events.recv() => {
                    if let Err(err) = self.engine.handle_upload_event(event).await {
                        error!(transfer_id = event.transfer_id, error = %err, "failed to apply upload event");
                    }
                }
                Some(result) = self.plugin_infos.recv() => {
                    self.engine.handle_plugin_info(result);
                }
                _ = sweep.tick() => {
                    match self.engine.expire(std::time::Instant::now()).await {
                        Ok(expired) if !expired.is_empty() => info!(count = expired.len(), "expired silent transfers"),
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "activity sweep failed"),
                    }
                }
                _ = sleep_until_opt(rescan_at), if rescan_at.is_some() => {
                    self.engine.discover_plugins();
                }
                _ = sleep_until_opt(idle_at), if idle_at.is_some() => {
                    if !self.engine.has_outstanding() {
                        info!("idle with no outstanding transfers, stopping");
                        break;
                    }
                    idle_at = self.config.idle_exit.map(|grace| Instant::now() + grace);
                }
            }
        }

        self.commands.close();
        if let Err(err) = self.engine.shutdown().await {
            error!(error = %err, "shutdown recovery failed");
        }
        info!("transfer engine stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        let engine = &mut self.engine;
        match command {
            EngineCommand::UploadMediaItem(request, reply) => {
                respond(reply, engine.create_upload(request).await)
            }
            EngineCommand::UploadContent {
                content,
                plugin_id,
                user_data,
                reply,
            } => respond(reply, engine.upload_content(content, plugin_id, user_data).await),
            EngineCommand::CreateDownload(request, reply) => {
                respond(reply, engine.create_download(request).await)
            }
            EngineCommand::CreateSync(request, reply) => respond(reply, engine.create_sync(request).await),
            EngineCommand::Start(transfer_id, reply) => respond(reply, engine.start(transfer_id).await),
            EngineCommand::Restart(transfer_id, reply) => respond(reply, engine.restart(transfer_id).await),
            EngineCommand::Cancel(transfer_id, reply) => respond(reply, engine.cancel(transfer_id).await),
            EngineCommand::Finish {
                transfer_id,
                status,
                reason,
                reply,
            } => respond(reply, engine.finish(transfer_id, status, &reason).await),
            EngineCommand::UpdateProgress(transfer_id, progress, reply) => {
                respond(reply, engine.update_progress(transfer_id, progress).await)
            }
            EngineCommand::Transfers(reply) => respond(reply, engine.transfers().await),
            EngineCommand::TransferMethods(reply) => respond(reply, Ok(engine.transfer_methods())),
            EngineCommand::ClearTransfers(reply) => respond(reply, engine.clear_transfers().await),
            EngineCommand::EnableNotifications(enabled, reply) => {
                engine.enable_notifications(enabled);
                respond(reply, Ok(()))
            }
            EngineCommand::NotificationsEnabled(reply) => {
                respond(reply, Ok(engine.notifications_enabled()))
            }
            EngineCommand::PluginsChanged => engine.schedule_plugin_rescan(Instant::now()),
            EngineCommand::ExitIfIdle | EngineCommand::Shutdown(_) => {}
        }
    }
}

fn respond<T>(reply: Reply<T>, result: Result<T, EngineError>) {
    if let Err(err) = &result {
        match err {
            EngineError::Storage(_) => error!(error = %err, "transfer engine call failed"),
            _ => warn!(error = %err, "transfer engine call rejected"),
        }
    }
    let _ = reply.send(result);
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
