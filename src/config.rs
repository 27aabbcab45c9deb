use {
    crate::error::{ConfigParseSnafu, ConfigReadSnafu, Result},
    clap::Parser,
    serde::Deserialize,
    snafu::ResultExt,
    std::fs::read_to_string,
    toml::from_str,
};

pub const DEFAULT_SIGNALING_HOST: &str = "127.0.0.1";
pub const DEFAULT_SIGNALING_PORT: u16 = 8080;

/// The public STUN servers used when no ICE configuration is supplied.
pub const DEFAULT_ICE_SERVERS: [&str; 4] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

#[derive(Parser)]
#[command(version, about = "Peer-to-peer collaborative text editing core")]
struct Opts {
    /// Config file to use; any subsequent arguments take precedence over
    /// the configuration file if it exists.
    #[arg(short, long)]
    config: Option<String>,

    /// Hostname of the signalling server.
    #[arg(long)]
    signaling_host: Option<String>,

    /// Port of the signalling server.
    #[arg(long)]
    signaling_port: Option<u16>,

    /// Username shown to other collaborators; generated when omitted.
    #[arg(short, long)]
    username: Option<String>,
}

/// One ICE server entry as handed to the transport.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: String,
}

/// The file half of the configuration.
#[derive(Deserialize, Default)]
struct FileConfig {
    signaling_host: Option<String>,
    signaling_port: Option<u16>,
    username: Option<String>,
    ice_servers: Option<Vec<IceServer>>,
}

/// Where the signalling rendezvous lives, which ICE servers to offer the
/// transport, and who we claim to be.
#[derive(Debug, Clone)]
pub struct Config {
    pub signaling_host: String,
    pub signaling_port: u16,
    pub username: Option<String>,
    pub ice_servers: Vec<IceServer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_host: DEFAULT_SIGNALING_HOST.to_string(),
            signaling_port: DEFAULT_SIGNALING_PORT,
            username: None,
            ice_servers: DEFAULT_ICE_SERVERS
                .iter()
                .map(|urls| IceServer {
                    urls: urls.to_string(),
                })
                .collect(),
        }
    }
}

impl Config {
    /// Parses command line arguments, folding in the config file when one
    /// is named. Arguments win over the file, the file over the defaults.
    pub fn parse() -> Result<Self> {
        let opts = Opts::parse();
        Self::from_opts(opts)
    }

    fn from_opts(opts: Opts) -> Result<Self> {
        let file = match &opts.config {
            Some(path) => Self::parse_file(path)?,
            None => FileConfig::default(),
        };

        let defaults = Config::default();
        Ok(Config {
            signaling_host: opts
                .signaling_host
                .or(file.signaling_host)
                .unwrap_or(defaults.signaling_host),
            signaling_port: opts
                .signaling_port
                .or(file.signaling_port)
                .unwrap_or(defaults.signaling_port),
            username: opts.username.or(file.username),
            ice_servers: file.ice_servers.unwrap_or(defaults.ice_servers),
        })
    }

    fn parse_file(path: &str) -> Result<FileConfig> {
        let contents = read_to_string(path).context(ConfigReadSnafu { path })?;
        from_str::<FileConfig>(&contents).context(ConfigParseSnafu { path })
    }

    pub fn signaling_address(&self) -> (String, u16) {
        (self.signaling_host.clone(), self.signaling_port)
    }
}
