use clap::Args;

use crate::config::ConfigArgs;

#[derive(Args)]
pub struct DeviceCommand {
    #[command(flatten)]
    pub config: ConfigArgs,
}
