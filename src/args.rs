use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ptt-core")]
#[command(author = "PTT Bridge Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Push-to-talk conferencing core", long_about = None)]
pub struct Args {
    /// HTTP port for signaling and the dashboard API (overrides HTTP_PORT)
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Directory for finished recordings
    #[arg(long)]
    pub recordings_dir: Option<PathBuf>,

    /// Scratch directory for in-flight recordings
    #[arg(long)]
    pub recordings_temp_dir: Option<PathBuf>,

    /// Directory for daily log files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    /// Environment configuration with CLI overrides applied on top.
    pub fn load_config(&self) -> Result<crate::config::Config, Box<dyn std::error::Error>> {
        let mut config = crate::config::Config::from_env();

        if let Some(port) = self.http_port {
            config.server.http_port = port;
        }
        if let Some(ref dir) = self.recordings_dir {
            config.paths.recordings_dir = dir.clone();
        }
        if let Some(ref dir) = self.recordings_temp_dir {
            config.paths.recordings_temp_dir = dir.clone();
        }
        if let Some(ref dir) = self.log_dir {
            config.paths.log_dir = dir.clone();
        }

        config.validate()?;
        Ok(config)
    }
}
