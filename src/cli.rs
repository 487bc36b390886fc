use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "serial-forwarder",
    version,
    about = "Buffers serial lines in SQLite and forwards them to a remote API"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Serial reader plus producer in one process (default).
    Run,
    /// Only read the serial port into the local buffer.
    Reader,
    /// Sync loop, deletion sweeper, heartbeat and status endpoint.
    Producer,
    /// Delete synced records once and exit.
    Sweep,
    /// Print buffer counts as JSON and exit.
    Status,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }
}
