pub mod orchestrator;
pub mod parsed;
pub mod subscription;
pub mod tunnel;
pub mod variation;
pub mod xray;

pub use orchestrator::{
    resolve_ipv4, Pipeline, PipelineOptions, PipelineOutcome, PipelineState, Stage,
};
pub use parsed::{ParsedConfig, Protocol, Security, Transport};
pub use subscription::{
    fetch_subscription, generate_from_template, load_addresses, load_configs_from_file,
    parse_lines,
};
pub use tunnel::{probe_tunnel, TunnelOutcome, TunnelProbe};
pub use variation::{generate, FragPreset, Fragment, GeneratorInput, Variation};
pub use xray::{socks_download, XrayRunner};
