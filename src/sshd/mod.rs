//! SSH front door.
//!
//! Accepts SSH connections, negotiates with the configured host keys and
//! algorithm policy, and authenticates public keys against the GitLab
//! internal API.  Only the configured user may log in.

pub mod server;
pub mod server_config;
pub mod session;

pub use server::start_ssh_server;
