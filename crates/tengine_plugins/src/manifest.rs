use crate::capability::{UploadCapability, UploadEventSink};
use crate::error::{CapabilityError, PluginError};
use crate::plugin::{PluginInfoSource, PluginLoader, ReadyInfoSource, TransferPlugin};
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tengine_transfer::{MediaItem, PluginDescriptor, TransferStatus};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A plugin declared by a `*.toml` file in the plugin directory.
///
/// ```toml
/// id = "example-share"
/// display_name = "Example share"
/// capabilities = ["image/*"]
/// command = ["/usr/libexec/example-upload", "--quiet"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub account_id: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub ui_path: String,
    #[serde(default)]
    pub service_icon: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub cancel_supported: bool,
    #[serde(default)]
    pub restart_supported: bool,
    pub command: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl PluginManifest {
    pub fn from_path(path: &Path) -> Result<Self, PluginError> {
        let raw = std::fs::read_to_string(path).map_err(|err| PluginError::Manifest {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let manifest: Self = toml::from_str(&raw).map_err(|err| PluginError::Manifest {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        if manifest.id.trim().is_empty() || manifest.command.is_empty() {
            return Err(PluginError::Manifest {
                path: path.to_path_buf(),
                reason: "id and command are required".to_string(),
            });
        }
        Ok(manifest)
    }

    pub fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            user_name: self.user_name.clone(),
            account_id: self.account_id,
            capabilities: self.capabilities.clone(),
            ui_path: self.ui_path.clone(),
        }
    }
}

/// Scans a directory for plugin manifests. Broken manifests are skipped with
/// a warning so one bad file cannot hide the others.
#[derive(Debug, Clone)]
pub struct ManifestPluginLoader {
    directory: PathBuf,
}

impl ManifestPluginLoader {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl PluginLoader for ManifestPluginLoader {
    fn load(&self) -> Result<Vec<Arc<dyn TransferPlugin>>, PluginError> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(PluginError::Load(format!(
                    "{}: {err}",
                    self.directory.display()
                )))
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut plugins: Vec<Arc<dyn TransferPlugin>> = Vec::with_capacity(paths.len());
        for path in paths {
            match PluginManifest::from_path(&path) {
                Ok(manifest) => plugins.push(Arc::new(ManifestPlugin::new(manifest))),
                Err(err) => warn!(error = %err, "skipping plugin manifest"),
            }
        }
        Ok(plugins)
    }
}

struct ManifestPlugin {
    manifest: Arc<PluginManifest>,
    info: Arc<ReadyInfoSource>,
}

impl ManifestPlugin {
    fn new(manifest: PluginManifest) -> Self {
        let info = Arc::new(ReadyInfoSource::new(vec![manifest.descriptor()]));
        Self {
            manifest: Arc::new(manifest),
            info,
        }
    }
}

impl TransferPlugin for ManifestPlugin {
    fn plugin_id(&self) -> &str {
        &self.manifest.id
    }

    fn enabled(&self) -> bool {
        self.manifest.enabled
    }

    fn info_source(&self) -> Arc<dyn PluginInfoSource> {
        self.info.clone()
    }

    fn upload_capability(&self) -> Box<dyn UploadCapability> {
        Box::new(CommandCapability::new(self.manifest.clone()))
    }
}

/// Runs the manifest command as a child process per upload.
///
/// The media item is passed in `TENGINE_*` environment variables and inline
/// content on stdin. Each stdout line holding a number in `[0, 1]` is a
/// progress report. Exit code 0 means Finished, anything else Interrupted.
pub struct CommandCapability {
    manifest: Arc<PluginManifest>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl CommandCapability {
    pub fn new(manifest: Arc<PluginManifest>) -> Self {
        Self {
            manifest,
            cancel_tx: None,
        }
    }

    fn command(&self, item: &MediaItem, events: &UploadEventSink) -> Result<Command, CapabilityError> {
        let (program, args) = self
            .manifest
            .command
            .split_first()
            .ok_or_else(|| CapabilityError::Launch("empty command".to_string()))?;
        let user_data = serde_json::to_string(&item.user_data)
            .map_err(|err| CapabilityError::InvalidItem(err.to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env("TENGINE_TRANSFER_ID", events.transfer_id().to_string())
            .env("TENGINE_URL", &item.url)
            .env("TENGINE_RESOURCE_NAME", &item.resource_name)
            .env("TENGINE_MIME_TYPE", &item.mime_type)
            .env("TENGINE_FILE_SIZE", item.file_size.to_string())
            .env("TENGINE_DISPLAY_NAME", &item.display_name)
            .env("TENGINE_TITLE", &item.title)
            .env("TENGINE_DESCRIPTION", &item.description)
            .env("TENGINE_ACCOUNT_ID", &item.account_id)
            .env("TENGINE_STRIP_METADATA", if item.strip_metadata { "1" } else { "0" })
            .env("TENGINE_SCALE_PERCENT", item.scale_percent.to_string())
            .env("TENGINE_USER_DATA", user_data)
            .stdin(if item.content.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(command)
    }
}

impl UploadCapability for CommandCapability {
    fn display_name(&self) -> String {
        self.manifest.display_name.clone()
    }

    fn service_icon(&self) -> String {
        self.manifest.service_icon.clone()
    }

    fn cancel_enabled(&self) -> bool {
        self.manifest.cancel_supported
    }

    fn restart_enabled(&self) -> bool {
        self.manifest.restart_supported
    }

    fn start(&mut self, item: MediaItem, events: UploadEventSink) -> Result<(), CapabilityError> {
        if item.url.is_empty() && item.content.is_none() {
            return Err(CapabilityError::InvalidItem(
                "neither url nor inline content given".to_string(),
            ));
        }

        let child = self
            .command(&item, &events)?
            .spawn()
            .map_err(|err| CapabilityError::Launch(err.to_string()))?;
        info!(
            plugin_id = %self.manifest.id,
            transfer_id = events.transfer_id(),
            pid = child.id(),
            "upload command launched"
        );

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancel_tx = Some(cancel_tx);
        events.status(TransferStatus::Started);
        tokio::spawn(supervise(child, item.content, cancel_rx, events));
        Ok(())
    }

    fn cancel(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    Canceled,
}

async fn supervise(
    mut child: Child,
    content: Option<String>,
    mut cancel_rx: oneshot::Receiver<()>,
    events: UploadEventSink,
) {
    if let (Some(mut stdin), Some(content)) = (child.stdin.take(), content) {
        if let Err(err) = stdin.write_all(content.as_bytes()).await {
            warn!(transfer_id = events.transfer_id(), error = %err, "writing upload content failed");
        }
    }

    let mut lines = child.stdout.take().map(|stdout| BufReader::new(stdout).lines());
    let outcome = loop {
        tokio::select! {
            // a dropped capability counts as a cancel
            _ = &mut cancel_rx => break Outcome::Canceled,
            line = next_line(&mut lines), if lines.is_some() => match line {
                Some(line) => report_line(&events, &line),
                None => lines = None,
            },
            status = child.wait() => break Outcome::Exited(status),
        }
    };

    let status = match outcome {
        Outcome::Canceled => {
            if let Err(err) = child.kill().await {
                warn!(transfer_id = events.transfer_id(), error = %err, "killing upload command failed");
            }
            TransferStatus::Canceled
        }
        Outcome::Exited(Ok(exit)) if exit.success() => {
            // drain progress written right before exit
            if let Some(mut lines) = lines {
                while let Ok(Some(line)) = lines.next_line().await {
                    report_line(&events, &line);
                }
            }
            TransferStatus::Finished
        }
        Outcome::Exited(Ok(exit)) => {
            warn!(transfer_id = events.transfer_id(), code = ?exit.code(), "upload command failed");
            TransferStatus::Interrupted
        }
        Outcome::Exited(Err(err)) => {
            warn!(transfer_id = events.transfer_id(), error = %err, "waiting on upload command failed");
            TransferStatus::Interrupted
        }
    };
    events.status(status);
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

fn report_line(events: &UploadEventSink, line: &str) {
    match parse_progress(line) {
        Some(progress) => {
            events.progress(progress);
        }
        None => debug!(transfer_id = events.transfer_id(), line, "upload command output"),
    }
}

fn parse_progress(line: &str) -> Option<f64> {
    line.trim()
        .parse::<f64>()
        .ok()
        .filter(|progress| (0.0..=1.0).contains(progress))
}

#[cfg(test)]
mod tests {
    use super::parse_progress;

    #[test]
    fn only_unit_interval_numbers_are_progress() {
        assert_eq!(parse_progress("0.5"), Some(0.5));
        assert_eq!(parse_progress(" 1 \n"), Some(1.0));
        assert_eq!(parse_progress("1.5"), None);
        assert_eq!(parse_progress("-0.1"), None);
        assert_eq!(parse_progress("uploading"), None);
    }
}
