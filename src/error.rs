use thiserror::Error;

/// Failures of the health-check phase. Any of these ends the phase; the
/// config pair on disk keeps its pre-check contents.
#[derive(Debug, Error)]
pub enum CheckError {
  #[error("control API not reachable on {host} (ports {ports:?})")]
  ApiUnreachable { host: String, ports: Vec<u16> },

  #[error("control API {path} returned {status}")]
  ApiStatus { path: String, status: u16 },

  #[error("http: {0}")]
  Http(#[from] reqwest::Error),

  #[error("engine binary: {0}")]
  EngineBinary(String),

  #[error("spawn engine: {0}")]
  Spawn(#[source] std::io::Error),

  #[error("engine did not become ready after {attempts} attempts")]
  EngineStartup { attempts: u32 },

  #[error("config: {0:#}")]
  Config(anyhow::Error),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),
}
