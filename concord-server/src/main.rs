use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

use concord_sync::{CollabServer, CreateWorkspace, SyncConfig, UserId};

#[derive(Parser)]
#[command(name = "concord-server")]
#[command(about = "Realtime workspace synchronization server")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "CONCORD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(short, long, env = "CONCORD_BIND")]
    bind: Option<String>,

    /// RocksDB directory; versions are kept in memory when unset
    #[arg(short, long, env = "CONCORD_STORAGE")]
    storage: Option<PathBuf>,

    /// Create a workspace at startup, as OWNER=NAME. Repeatable.
    #[arg(long = "workspace", value_parser = parse_workspace)]
    workspaces: Vec<(String, String)>,
}

fn parse_workspace(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
            Ok((owner.to_string(), name.to_string()))
        }
        _ => Err(format!("expected OWNER=NAME, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            info!("Config file: {}", path.display());
            SyncConfig::load(path)?
        }
        None => SyncConfig::default(),
    };

    // Apply CLI overrides
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    if let Some(storage) = cli.storage {
        config.server.storage_path = Some(storage);
    }

    let server = CollabServer::new(config)?;
    let manager = server.manager();
    for (owner, name) in cli.workspaces {
        let workspace = manager
            .create_workspace(&UserId::new(owner), CreateWorkspace::named(name))
            .await;
        info!("Workspace {} '{}' owned by {}", workspace.id, workspace.name, workspace.owner);
    }

    info!("Starting concord-server on {}", server.bind_addr());
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workspace() {
        assert_eq!(
            parse_workspace("alice=Design review"),
            Ok(("alice".to_string(), "Design review".to_string()))
        );
        assert!(parse_workspace("alice").is_err());
        assert!(parse_workspace("=Ops").is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "concord-server",
            "--bind",
            "0.0.0.0:9000",
            "--workspace",
            "alice=Ops",
            "--workspace",
            "bob=Legal",
        ]);
        assert_eq!(cli.bind.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(cli.workspaces.len(), 2);
        assert!(cli.storage.is_none());
    }
}
