//! SSH front door for GitLab.
//!
//! The listener lives in [`sshd`]; every authorization decision is delegated
//! to the GitLab internal API through the signed client in [`gitlabnet`].

pub mod command;
pub mod config;
pub mod gitlabnet;
pub mod sshd;

#[cfg(test)]
mod testserver;
