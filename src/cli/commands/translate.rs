use clap::Args;

use crate::config::ConfigArgs;

#[derive(Args)]
pub struct TranslateCommand {
    /// Text to translate (read from stdin when omitted)
    pub text: Option<String>,

    /// Source language code
    #[arg(short, long, default_value = "en")]
    pub source: String,

    /// Target language code
    #[arg(short, long, default_value = "zh-TW")]
    pub target: String,

    #[command(flatten)]
    pub config: ConfigArgs,
}
