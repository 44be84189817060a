//! Server host-key verification policies

use std::path::PathBuf;

use russh::keys::ssh_key::{HashAlg, PublicKey};

/// How an endpoint decides whether to trust the key a server presents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Trust on first use: unknown hosts are learned, changed keys rejected
    AcceptNew { known_hosts: PathBuf },
    /// The host must already be listed with a matching key
    Strict { known_hosts: PathBuf },
    /// The key's `SHA256:` fingerprint must match exactly
    Fingerprint(String),
    /// Accept any key
    Insecure,
}

/// Outcome of checking a server key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerdict {
    Trusted,
    Learned,
    Rejected(String),
}

impl HostKeyVerdict {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// `~/.ssh/known_hosts`, or a relative path if the home directory is unknown
pub fn default_known_hosts() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".ssh")
        .join("known_hosts")
}

pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

impl HostKeyPolicy {
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerdict {
        match self {
            Self::Insecure => {
                tracing::warn!(
                    host,
                    port,
                    fingerprint = %fingerprint(key),
                    "Accepting host key without verification"
                );
                HostKeyVerdict::Trusted
            }
            Self::Fingerprint(expected) => {
                let actual = fingerprint(key);
                if actual == expected.trim() {
                    HostKeyVerdict::Trusted
                } else {
                    HostKeyVerdict::Rejected(format!(
                        "host key fingerprint {} does not match pinned {}",
                        actual, expected
                    ))
                }
            }
            Self::Strict { known_hosts } => {
                match russh::keys::known_hosts::check_known_hosts_path(host, port, key, known_hosts)
                {
                    Ok(true) => HostKeyVerdict::Trusted,
                    Ok(false) => HostKeyVerdict::Rejected(format!(
                        "host {}:{} is not in {}",
                        host,
                        port,
                        known_hosts.display()
                    )),
                    Err(e) => HostKeyVerdict::Rejected(e.to_string()),
                }
            }
            Self::AcceptNew { known_hosts } => {
                match russh::keys::known_hosts::check_known_hosts_path(host, port, key, known_hosts)
                {
                    Ok(true) => HostKeyVerdict::Trusted,
                    Ok(false) => {
                        if let Some(parent) = known_hosts.parent() {
                            let _ = std::fs::create_dir_all(parent);
                        }
                        match russh::keys::known_hosts::learn_known_hosts_path(
                            host,
                            port,
                            key,
                            known_hosts,
                        ) {
                            Ok(()) => {
                                tracing::info!(
                                    host,
                                    port,
                                    fingerprint = %fingerprint(key),
                                    path = %known_hosts.display(),
                                    "Learned new host key"
                                );
                                HostKeyVerdict::Learned
                            }
                            Err(e) => HostKeyVerdict::Rejected(format!(
                                "could not record host key in {}: {}",
                                known_hosts.display(),
                                e
                            )),
                        }
                    }
                    Err(e) => HostKeyVerdict::Rejected(e.to_string()),
                }
            }
        }
    }
}
