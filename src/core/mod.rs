pub mod debug_log;
pub mod expand;
pub mod funnel;
pub mod pipeline;
pub mod probe;
pub mod rate_limiter;
pub mod scanner;
pub mod score;
pub mod speed;
pub mod tls;
pub mod types;

// Re-export commonly used items
pub use debug_log::{dbg_line, debug_log, DebugLog};
pub use funnel::{build_rounds, Funnel, RoundCfg};
pub use probe::{tcp_probe, tls_probe, CfOriginPolicy, Prober, TlsProber};
pub use rate_limiter::RateLimiter;
pub use scanner::{scan, ScanOptions, ScanOutcome};
pub use score::{calc_scores, score, sorted_alive, sorted_all, ScoreBasis, SortKey};
pub use speed::{download, SpeedClient, TlsSpeedClient};
pub use types::*;
