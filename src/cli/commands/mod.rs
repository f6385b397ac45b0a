pub mod config;
pub mod device;
pub mod server;
pub mod translate;

pub use config::ConfigCommand;
pub use device::DeviceCommand;
pub use server::ServerCommand;
pub use translate::TranslateCommand;

use clap::Subcommand;

use crate::config::ConfigArgs;

#[derive(Subcommand)]
pub enum Commands {
    /// Start the translation server
    Server(ServerCommand),
    /// Translate text locally, streaming the output to stdout
    Translate(TranslateCommand),
    /// Check the accelerator and run a small tensor operation on it
    Device(DeviceCommand),
    /// Print the effective configuration
    Config(ConfigCommand),
}

impl Commands {
    /// Configuration overrides carried by every command
    pub fn config_args(&self) -> &ConfigArgs {
        match self {
            Commands::Server(cmd) => &cmd.config,
            Commands::Translate(cmd) => &cmd.config,
            Commands::Device(cmd) => &cmd.config,
            Commands::Config(cmd) => &cmd.config,
        }
    }
}
