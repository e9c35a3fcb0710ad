use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cfscan")]
#[command(version = concat!("Ver:", env!("CARGO_PKG_VERSION")))]
#[command(about = "Cloudflare edge probe and proxy pipeline engine")]
pub struct Cli {
    /// Input file: config URIs (one per line) or freeform IPs/CIDRs
    #[arg(short = 'i', long = "input")]
    pub input: Option<String>,

    /// Fetch configs from a subscription URL
    #[arg(long = "sub")]
    pub sub: Option<String>,

    /// Template URI; addresses from --addresses are substituted in
    #[arg(long = "template")]
    pub template: Option<String>,

    /// Address list (JSON or plain lines) used with --template
    #[arg(long = "addresses")]
    pub addresses: Option<String>,

    /// Scan the published Cloudflare ranges for clean IPs
    #[arg(long = "find-clean")]
    pub find_clean: bool,

    /// Clean-scan mode: quick | normal | full | mega
    #[arg(long = "clean-mode", default_value = "normal")]
    pub clean_mode: String,

    /// Funnel preset: quick | normal | thorough
    #[arg(long = "mode", default_value = "normal")]
    pub mode: String,

    /// Run the variation pipeline on the first loaded config
    #[arg(long = "pipeline")]
    pub pipeline: bool,

    /// Comma-separated ports for scanning
    #[arg(long = "ports")]
    pub ports: Option<String>,

    /// Latency-phase worker count
    #[arg(long = "workers")]
    pub workers: Option<usize>,

    /// Speed-phase worker count
    #[arg(long = "speed-workers")]
    pub speed_workers: Option<usize>,

    /// Per-probe timeout in seconds
    #[arg(long = "timeout")]
    pub timeout: Option<f64>,

    /// Per-download timeout in seconds
    #[arg(long = "speed-timeout")]
    pub speed_timeout: Option<f64>,

    /// Show the top N results (0 = all)
    #[arg(long = "top", default_value_t = 50)]
    pub top: usize,

    /// Pipeline: total variation budget
    #[arg(long = "max-variations")]
    pub max_variations: Option<usize>,

    /// Pipeline: SNIs tried per IP
    #[arg(long = "max-snis")]
    pub max_snis: Option<usize>,

    /// Pipeline: extra SNI pool, comma-separated
    #[arg(long = "sni-pool")]
    pub sni_pool: Option<String>,

    /// Pipeline: fragment preset (none | light | medium | heavy | all)
    #[arg(long = "fragments", default_value = "all")]
    pub fragments: String,

    /// Pipeline: extra transports to try, comma-separated (ws,xhttp,grpc,h2)
    #[arg(long = "transports")]
    pub transports: Option<String>,

    /// Path to the external proxy binary for non-native variations
    #[arg(long = "xray-bin", default_value = "xray")]
    pub xray_bin: String,

    /// Emit results as JSON instead of a table
    #[arg(long = "json")]
    pub json: bool,

    /// Seed the shuffle/sample RNG for reproducible runs
    #[arg(long = "seed")]
    pub seed: Option<u64>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn parsed_ports(&self) -> Option<Vec<u16>> {
        self.ports.as_ref().map(|s| {
            s.split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect()
        })
    }
}
