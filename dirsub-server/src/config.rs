use anyhow::Context;
use dirsub_core::OrchestratorConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Process-level settings for the HTTP server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Postgres backend when set; in-memory store otherwise.
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Run the lease housekeeper in this process.
    pub housekeeper: bool,
    pub orchestrator: OrchestratorConfig,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("invalid listen host {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Load `.env` if present. Returns whether a file was read.
pub fn load_env_file(path: Option<&PathBuf>) -> anyhow::Result<bool> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            _ => Err(err),
        })?,
        None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            _ => Err(err),
        })?,
    };
    Ok(loaded)
}

/// Orchestrator settings from an explicit file, or the usual env/file lookup.
pub fn load_orchestrator_config(path: Option<&PathBuf>) -> anyhow::Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::load_from_file(path),
        None => OrchestratorConfig::load_from_env(),
    }
}
