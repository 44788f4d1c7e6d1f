use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tcpshaper_common::ShaperConfig;
use tcpshaper_core::ListenerRates;
use tokio::sync::mpsc;
use tracing::*;

pub fn load_config(path: &Path) -> Result<ShaperConfig> {
    let config: ShaperConfig = Config::builder()
        .add_source(File::from(path))
        .add_source(
            Environment::with_prefix("TCPSHAPER")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Could not load config")?
        .try_deserialize()
        .context("Could not parse config")?;

    config.validate().context("Invalid config")?;

    info!(
        "Using config: {path:?} (listen: {}, upstream: {})",
        config.listen, config.upstream,
    );
    Ok(config)
}

/// Re-reads the config file and pushes its rates into the live settings.
/// Returns the new config so the caller can diff the next reload against it.
pub fn reload_rates(
    path: &Path,
    running: &ShaperConfig,
    rates: &ListenerRates,
) -> Result<ShaperConfig> {
    let new_config = load_config(path)?;

    if new_config.listen != running.listen {
        warn!(
            old = %running.listen,
            new = %new_config.listen,
            "Listen address changed, restart to apply"
        );
    }
    if new_config.upstream != running.upstream {
        warn!(
            old = %running.upstream,
            new = %new_config.upstream,
            "Upstream changed, restart to apply"
        );
    }

    rates.apply(&new_config.server, &new_config.connection);
    info!(
        server_read = %new_config.server.read,
        server_write = %new_config.server.write,
        connection_read = %new_config.connection.read,
        connection_write = %new_config.connection.write,
        "Reloaded rates"
    );
    Ok(new_config)
}

pub async fn watch_config(
    path: PathBuf,
    mut running: ShaperConfig,
    rates: ListenerRates,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(1);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            // receiver is gone once the watch loop ends
            let _ = tx.blocking_send(res);
        },
        notify::Config::default(),
    )?;

    // Editors often replace the file instead of writing to it, so watch
    // the directory and pick out our file
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    watcher.watch(&directory, RecursiveMode::NonRecursive)?;
    let file_name = path.file_name().map(|n| n.to_os_string());

    loop {
        match rx.recv().await {
            Some(Ok(event)) => {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if !ours || !(event.kind.is_modify() || event.kind.is_create()) {
                    continue;
                }
                match reload_rates(&path, &running, &rates) {
                    Ok(new_config) => running = new_config,
                    Err(error) => error!(?error, "Failed to reload config"),
                }
            }
            Some(Err(error)) => error!(?error, "Failed to watch config"),
            None => anyhow::bail!("Config watch failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tcpshaper_core::Limit;

    use super::*;

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = config_file(
            r#"
listen: 127.0.0.1:7000
upstream: localhost:8080
server:
  read: { bytes_per_second: 4096, burst: 1024 }
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.server.read.bytes_per_second, 4096);
        assert!(config.connection.read.is_unlimited());
    }

    #[test]
    fn test_load_config_rejects_bad_upstream() {
        let file = config_file("upstream: nowhere\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_reload_applies_rates() {
        let file = config_file("upstream: localhost:8080\n");
        let running = load_config(file.path()).unwrap();
        let rates = ListenerRates::from_config(&running.server, &running.connection);
        assert!(rates.read_connection.limit().is_unlimited());

        std::fs::write(
            file.path(),
            r#"
upstream: localhost:9090
connection:
  read: { bytes_per_second: 100, burst: 10 }
"#,
        )
        .unwrap();
        let reloaded = reload_rates(file.path(), &running, &rates).unwrap();
        assert_eq!(reloaded.upstream, "localhost:9090");
        assert_eq!(rates.read_connection.limit(), Limit::from_bytes_per_second(100));
        assert_eq!(rates.read_connection.burst(), 10);
        assert!(rates.write_connection.limit().is_unlimited());
    }

    #[test]
    fn test_failed_reload_keeps_rates() {
        let file = config_file(
            r#"
upstream: localhost:8080
server:
  write: { bytes_per_second: 500 }
"#,
        );
        let running = load_config(file.path()).unwrap();
        let rates = ListenerRates::from_config(&running.server, &running.connection);

        std::fs::write(file.path(), "server: [not, a, map]\n").unwrap();
        assert!(reload_rates(file.path(), &running, &rates).is_err());
        assert_eq!(rates.write_server.burst(), 500);
    }
}
