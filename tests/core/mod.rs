pub mod debug_log_tests;
pub mod expand_tests;
pub mod funnel_tests;
pub mod pipeline;
pub mod rate_limiter_tests;
pub mod scanner_tests;
