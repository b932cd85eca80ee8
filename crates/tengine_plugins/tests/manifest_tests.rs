use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tengine_plugins::{
    ManifestPluginLoader, PluginLoader, PluginRegistry, UploadEventKind, UploadEventSink,
    DEFAULT_RESCAN_DEBOUNCE,
};
use tengine_transfer::{MediaItem, TransferStatus};
use tokio::sync::mpsc;

fn write_manifest(dir: &TempDir, file: &str, body: &str) {
    fs::write(dir.path().join(file), body).unwrap();
}

#[test]
fn loader_reads_valid_manifests_and_skips_broken_ones() {
    let dir = TempDir::new().unwrap();
    write_manifest(
        &dir,
        "a-share.toml",
        r#"
id = "a-share"
display_name = "A share"
capabilities = ["image/*"]
command = ["true"]
"#,
    );
    write_manifest(&dir, "broken.toml", "id = ");
    write_manifest(&dir, "notes.txt", "not a manifest");
    write_manifest(
        &dir,
        "z-off.toml",
        r#"
id = "z-off"
display_name = "Off"
enabled = false
command = ["true"]
"#,
    );

    let plugins = ManifestPluginLoader::new(dir.path()).load().unwrap();
    let ids: Vec<_> = plugins.iter().map(|p| p.plugin_id().to_string()).collect();
    assert_eq!(ids, vec!["a-share", "z-off"]);
    assert!(plugins[0].enabled());
    assert!(!plugins[1].enabled());

    let info = plugins[0].info_source();
    assert!(info.ready());
    assert_eq!(info.info()[0].capabilities, vec!["image/*".to_string()]);
}

#[test]
fn missing_directory_means_no_plugins() {
    let dir = TempDir::new().unwrap();
    let plugins = ManifestPluginLoader::new(dir.path().join("absent"))
        .load()
        .unwrap();
    assert!(plugins.is_empty());
}

#[tokio::test]
async fn registry_discovers_manifest_plugins() {
    let dir = TempDir::new().unwrap();
    write_manifest(
        &dir,
        "share.toml",
        r#"
id = "share"
display_name = "Share"
service_icon = "icon-share"
command = ["true"]
"#,
    );

    let (mut registry, _rx) = PluginRegistry::new(
        Arc::new(ManifestPluginLoader::new(dir.path())),
        DEFAULT_RESCAN_DEBOUNCE,
    );
    assert!(registry.discover());
    assert_eq!(registry.methods().len(), 1);

    let capability = registry.load_capability("share").unwrap();
    assert_eq!(capability.display_name(), "Share");
    assert_eq!(capability.service_icon(), "icon-share");
    assert!(capability.cancel_enabled());
    assert!(!capability.restart_enabled());
}

async fn collect_until_terminal(
    rx: &mut mpsc::UnboundedReceiver<tengine_plugins::UploadEvent>,
) -> Vec<UploadEventKind> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("capability reports in time")
            .expect("sink alive");
        seen.push(event.kind);
        if let UploadEventKind::Status(status) = event.kind {
            if status.is_terminal() {
                return seen;
            }
        }
    }
}

#[cfg(unix)]
#[tokio::test]
async fn command_capability_reports_progress_and_exit_status() {
    let dir = TempDir::new().unwrap();
    write_manifest(
        &dir,
        "ok.toml",
        r#"
id = "ok"
display_name = "Ok"
command = ["sh", "-c", "echo 0.5; echo working; echo 1"]
"#,
    );
    write_manifest(
        &dir,
        "fail.toml",
        r#"
id = "fail"
display_name = "Fail"
command = ["sh", "-c", "exit 3"]
"#,
    );
    let (mut registry, _rx) = PluginRegistry::new(
        Arc::new(ManifestPluginLoader::new(dir.path())),
        DEFAULT_RESCAN_DEBOUNCE,
    );
    registry.discover();

    let item = MediaItem {
        url: "file:///tmp/picture.jpg".into(),
        ..Default::default()
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut ok = registry.load_capability("ok").unwrap();
    ok.start(item.clone(), UploadEventSink::new(1, 1, tx.clone()))
        .unwrap();
    let seen = collect_until_terminal(&mut rx).await;
    assert_eq!(seen.first(), Some(&UploadEventKind::Status(TransferStatus::Started)));
    assert!(seen.contains(&UploadEventKind::Progress(0.5)));
    assert_eq!(seen.last(), Some(&UploadEventKind::Status(TransferStatus::Finished)));

    let mut fail = registry.load_capability("fail").unwrap();
    fail.start(item, UploadEventSink::new(2, 2, tx)).unwrap();
    let seen = collect_until_terminal(&mut rx).await;
    assert_eq!(seen.last(), Some(&UploadEventKind::Status(TransferStatus::Interrupted)));
}

#[cfg(unix)]
#[tokio::test]
async fn canceling_kills_the_command() {
    let dir = TempDir::new().unwrap();
    write_manifest(
        &dir,
        "slow.toml",
        r#"
id = "slow"
display_name = "Slow"
command = ["sh", "-c", "cat > /dev/null; sleep 30"]
"#,
    );
    let (mut registry, _rx) = PluginRegistry::new(
        Arc::new(ManifestPluginLoader::new(dir.path())),
        DEFAULT_RESCAN_DEBOUNCE,
    );
    registry.discover();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut capability = registry.load_capability("slow").unwrap();
    capability
        .start(
            MediaItem {
                content: Some("BEGIN:VCARD\nEND:VCARD\n".into()),
                ..Default::default()
            },
            UploadEventSink::new(5, 1, tx),
        )
        .unwrap();
    capability.cancel();

    let seen = collect_until_terminal(&mut rx).await;
    assert_eq!(seen.last(), Some(&UploadEventKind::Status(TransferStatus::Canceled)));
}
