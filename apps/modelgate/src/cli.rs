use clap::Parser;

#[derive(Parser)]
#[command(name = "modelgate", about = "Multi-provider AI gateway")]
pub(crate) struct Cli {
    /// Database DSN; SQLite by default.
    #[arg(long, default_value = "sqlite://modelgate.db?mode=rwc")]
    pub(crate) dsn: String,
    #[arg(long, default_value = "127.0.0.1")]
    pub(crate) host: String,
    #[arg(long, default_value_t = 8787)]
    pub(crate) port: u16,
    /// Optional JSON file with gateway settings; missing fields keep their
    /// defaults.
    #[arg(long)]
    pub(crate) config: Option<std::path::PathBuf>,
    /// Outbound proxy for upstream calls.
    #[arg(long)]
    pub(crate) proxy: Option<String>,
}
