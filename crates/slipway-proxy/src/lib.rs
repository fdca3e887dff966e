//! slipway-proxy — routing live traffic to the active slot.
//!
//! Each (project, environment) owns one Caddy site file. The active slot's
//! port is listed first and the previous slot's second, with `lb_policy
//! first`, so the old slot only receives requests while the new one is
//! failing its upstream health checks.

pub mod caddyfile;
pub mod controller;
pub mod error;
pub mod manager;

pub use caddyfile::{SiteBlock, UpstreamPolicy, default_host, default_host_clash, site_file_name};
pub use controller::{CaddyController, ProxyController};
pub use error::{ProxyError, ProxyResult};
pub use manager::{AppliedChange, ProxyConfigManager};
