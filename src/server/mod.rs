pub mod config;
mod daemon;
mod routes;
mod ws;

pub use config::{
  AuthSection, BackupSection, LoggingSection, PostgresSection, QuerySection, ServerConfig,
  ServerSection,
};
pub use daemon::Daemon;
pub use routes::AppState;
