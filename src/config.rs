use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Json, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default TCP port for p2p connections.
pub const DEFAULT_P2P_PORT: u16 = 2017;

/// Default port for the block-file HTTP server.
pub const DEFAULT_HTTP_PORT: u16 = 2018;

/// Default data directory name, created under $HOME.
pub const DEFAULT_DATA_DIR_NAME: &str = ".daisy";

/// Daisy blockchain node
#[derive(Parser, Debug, Clone)]
#[command(name = "daisy-node", version, about = "Daisy blockchain node")]
pub struct Cli {
    /// Path to JSON config file
    #[arg(long = "conf", value_name = "FILE")]
    pub config: Option<String>,

    /// P2P port
    #[arg(long, env = "DAISY_P2P_PORT")]
    pub port: Option<u16>,

    /// Block-file HTTP server port
    #[arg(long, env = "DAISY_HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Data directory for persistent state (stores, block files)
    #[arg(long = "dir", env = "DAISY_DATA_DIR")]
    pub data_dir: Option<String>,

    /// Enable structured JSON logging
    #[arg(long, env = "DAISY_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the public key hashes backed by local private keys
    Mykeys,
    /// Run a read-only SQL query over every block in the chain
    Query {
        /// SQL text, e.g. "SELECT * FROM products"
        sql: String,
    },
    /// Sign a prepared SQLite file and import it as the next block
    Signimportblock {
        /// Path to the SQLite database to sign and import
        file: String,
    },
    /// Create a brand new chain from a chain parameters file
    Newchain {
        /// Path to a chainparams.json without cryptographic properties
        params: String,
    },
    /// Bootstrap this node from another node's HTTP block server
    Pull {
        /// Base URL, e.g. http://example.com:2018/
        url: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// TCP port the p2p listener binds.
    pub p2p_port: u16,
    /// Port for the block-file HTTP server.
    pub http_port: u16,
    /// Directory holding the stores, chainparams.json and blocks/.
    pub data_dir: String,
    /// Send blocks inline (zlib-base64) instead of via HTTP URLs.
    pub p2p_block_inline: bool,
    /// Structured JSON log output.
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            p2p_port: DEFAULT_P2P_PORT,
            http_port: DEFAULT_HTTP_PORT,
            data_dir: default_data_dir(),
            p2p_block_inline: true,
            json_logs: false,
        }
    }
}

fn default_data_dir() -> String {
    match std::env::var("HOME") {
        Ok(home) => format!("{}/{}", home, DEFAULT_DATA_DIR_NAME),
        Err(_) => format!("./{}", DEFAULT_DATA_DIR_NAME),
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < JSON config file < env vars (DAISY_*) < CLI flags
    pub fn load(cli: &Cli) -> Result<Self, figment::Error> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = &cli.config {
            figment = figment.merge(Json::file(path));
        }
        let mut config: Config = figment.merge(Env::prefixed("DAISY_")).extract()?;

        // CLI flags override everything
        if let Some(port) = cli.port {
            config.p2p_port = port;
        }
        if let Some(port) = cli.http_port {
            config.http_port = port;
        }
        if let Some(dir) = &cli.data_dir {
            config.data_dir = dir.clone();
        }
        if cli.json_logs {
            config.json_logs = true;
        }
        Ok(config)
    }
}
