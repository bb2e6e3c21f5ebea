use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::Level;

use crate::server::SslMode;

/// pg_bridge: PostgreSQL wire-protocol front end for a cloud SQL backend.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(short = 'p', long = "project", env, help = "cloud project id")]
    pub project: Option<String>,

    #[arg(short = 'i', long = "instance", env, help = "cloud instance id")]
    pub instance: Option<String>,

    #[arg(
        short = 'd',
        long = "database",
        env,
        help = "default database for connections that do not name one"
    )]
    pub database: Option<String>,

    #[arg(short = 's', long = "port", default_value_t = 5432, env)]
    pub port: u16,

    #[arg(
        long = "dir",
        env,
        help = "directory to create the Unix-domain socket in"
    )]
    pub unix_socket_dir: Option<PathBuf>,

    #[arg(
        short = 'x',
        long = "disable-auth",
        default_value_t = false,
        env,
        help = "disable client authentication for local development"
    )]
    pub disable_auth: bool,

    #[clap(long = "ssl", value_enum, default_value_t = SslMode::Disable, env)]
    pub ssl: SslMode,

    #[arg(
        long,
        default_value_t = false,
        env,
        help = "ignore unknown settings instead of raising an error"
    )]
    pub lenient_settings: bool,

    #[arg(short = 'l', long, default_value_t = Level::INFO, env)]
    pub log_level: Level,

    #[clap(short = 'F', long, value_enum, default_value_t = LogFormat::Text, env)]
    pub log_format: LogFormat,

    #[arg(
        long,
        default_value_t = false,
        env,
        help = "disable colors in the log output"
    )]
    pub no_color: bool,
}

pub fn parse() -> Args {
    Args::parse()
}

#[derive(ValueEnum, Clone, Debug)]
pub enum LogFormat {
    Text,
    Structured,
    Debug,
}
