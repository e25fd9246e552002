//-
// Copyright (c) 2024, 2025, Jason Lingle
//
// This file is part of Smtpin.
//
// Smtpin is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Smtpin is distributed  in the hope that it  will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied warranty  of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Smtpin. If not, see <http://www.gnu.org/licenses/>.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Smtpin.
///
/// This is stored in a file named `smtpin.toml` under the Smtpin system
/// root, which is typically `/usr/local/etc/smtpin` or `/etc/smtpin`. The
/// same directory holds the policy cdb files and
/// `public_suffix_list.dat`.
///
/// Every limit ghsmtp-era servers kept as process-wide mutable state is an
/// explicit field here; the session receives the whole struct at
/// construction and nothing is consulted through globals.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SystemConfig {
    /// Configuration for TLS.
    pub tls: TlsConfig,

    /// Options for the SMTP receiver itself.
    #[serde(default)]
    pub smtp: SmtpConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SmtpConfig {
    /// The name we hold ourselves out as. If empty, the `GHSMTP_SERVER_ID`
    /// environment variable, then the machine host name, then our own
    /// address literal are tried in that order.
    #[serde(default)]
    pub host_name: String,

    /// Maximum message size advertised in EHLO SIZE and enforced during
    /// DATA/BDAT.
    #[serde(default = "SmtpConfig::default_max_msg_size")]
    pub max_msg_size: u64,

    /// Maximum message size once the peer has negotiated TLS.
    #[serde(default = "SmtpConfig::default_max_msg_size_tls")]
    pub max_msg_size_tls: u64,

    /// Cap on the header block captured for logging/verification.
    #[serde(default = "SmtpConfig::default_max_hdr_size")]
    pub max_hdr_size: u64,

    #[serde(default = "SmtpConfig::default_max_recipients")]
    pub max_recipients_per_message: usize,

    #[serde(default = "SmtpConfig::default_max_unrecognized_cmds")]
    pub max_unrecognized_cmds: u32,

    /// DNS blocklists probed for non-whitelisted IPv4 peers.
    #[serde(default = "SmtpConfig::default_rbls")]
    pub rbls: Vec<String>,

    /// URI blocklists probed for sender domains.
    #[serde(default = "SmtpConfig::default_uribls")]
    pub uribls: Vec<String>,

    /// Whether an SPF `fail` is a hard 550 rather than a spam signal.
    #[serde(default)]
    pub reject_spf_fail: bool,

    /// Seconds to sit between the two halves of the greeting watching for
    /// clients that talk before they are spoken to.
    #[serde(default = "SmtpConfig::default_greeting_wait_secs")]
    pub greeting_wait_secs: u64,
}

impl SmtpConfig {
    fn default_max_msg_size() -> u64 {
        10 * 1024 * 1024
    }

    fn default_max_msg_size_tls() -> u64 {
        20 * 1024 * 1024
    }

    fn default_max_hdr_size() -> u64 {
        16 * 1024
    }

    fn default_max_recipients() -> usize {
        100
    }

    fn default_max_unrecognized_cmds() -> u32 {
        20
    }

    fn default_rbls() -> Vec<String> {
        vec![
            "zen.spamhaus.org".to_owned(),
            "b.barracudacentral.org".to_owned(),
        ]
    }

    fn default_uribls() -> Vec<String> {
        vec![
            "dbl.spamhaus.org".to_owned(),
            "black.uribl.com".to_owned(),
            "multi.surbl.org".to_owned(),
        ]
    }

    fn default_greeting_wait_secs() -> u64 {
        3
    }

    pub fn greeting_wait(&self) -> Duration {
        Duration::from_secs(self.greeting_wait_secs)
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty SmtpConfig parses")
    }
}

/// Timeouts which are protocol constants rather than tunables.
///
/// Read timeout per RFC 1123 § 5.3.2 and RFC 5321 § 4.5.3.2.7.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
pub const STARTTLS_TIMEOUT: Duration = Duration::from_secs(10);
pub const DNS_TIMEOUT: Duration = Duration::from_secs(20);

/// Locates the maildir: `$MAILDIR`, else `$HOME/Maildir`.
pub fn locate_maildir() -> Option<PathBuf> {
    if let Some(md) = std::env::var_os("MAILDIR") {
        return Some(PathBuf::from(md));
    }

    std::env::var_os("HOME").map(|home| {
        let mut p = PathBuf::from(home);
        p.push("Maildir");
        p
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = SmtpConfig::default();
        assert_eq!(100, config.max_recipients_per_message);
        assert_eq!(20, config.max_unrecognized_cmds);
        assert_eq!(2, config.rbls.len());
        assert_eq!(3, config.uribls.len());
        assert!(!config.reject_spf_fail);
    }

    #[test]
    fn parse_partial() {
        let config: SystemConfig = toml::from_str(
            r#"
            [tls]
            private_key = "/etc/smtpin/key.pem"
            certificate_chain = "/etc/smtpin/cert.pem"

            [smtp]
            host_name = "mx.example.com"
            max_msg_size = 1048576
            reject_spf_fail = true
            "#,
        )
        .unwrap();

        assert_eq!("mx.example.com", config.smtp.host_name);
        assert_eq!(1048576, config.smtp.max_msg_size);
        assert!(config.smtp.reject_spf_fail);
        assert_eq!(100, config.smtp.max_recipients_per_message);
    }
}
