use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "chatline-server", about = "Chatline real-time messaging gateway")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/chatline.toml")]
    pub config: String,
}
