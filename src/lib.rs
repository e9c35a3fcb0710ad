/*!
cfscan - Cloudflare edge probe and proxy pipeline engine.

The crate has three cooperating paths:

- **Clean-IP scanning**: expand published Cloudflare ranges into candidate
  endpoints and fan TLS probes out over a bounded worker pool (`core::expand`,
  `core::scanner`).
- **Speed funnel**: rank alive IPs by a multi-round elimination funnel with
  provider rate-limit enforcement and a CDN fallback (`core::funnel`,
  `core::speed`, `core::rate_limiter`).
- **Proxy pipeline**: validate VLESS/VMess configs end-to-end and explode
  SNI / fragment / transport / port variations, measured either by a native
  VLESS-over-WebSocket prober or an external proxy subprocess
  (`core::pipeline`).

All concurrency is cooperative on a single tokio runtime; cancellation is an
interrupt flag observed at every suspension point. The engine's only on-disk
state is a size-rotated debug log.
*/

pub mod cli;
pub mod config;
pub mod core;
