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

//! The ham/spam verdict, computed once per message before the Maildir file
//! is opened.
//!
//! There is no content analysis here; the verdict composes the signals the
//! session has already gathered. Every rule that holds is recorded so the
//! log shows each contributing cause, not just the first.

use std::path::Path;

use log::info;

use super::psl::PublicSuffixList;
use super::spf::SpfResult;
use super::syntax::Domain;
use crate::support::cdb::Cdb;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpamStatus {
    Ham,
    Spam,
}

pub struct Signals<'a> {
    pub tls: bool,
    pub client_identity: Option<&'a Domain>,
    pub fcrdns: &'a [String],
    pub spf_result: Option<SpfResult>,
    pub spf_domain: Option<&'a str>,
    pub ip_whitelisted: bool,
}

#[derive(Clone, Debug)]
pub struct SpamVerdict {
    pub status: SpamStatus,
    pub reasons: Vec<String>,
}

impl SpamVerdict {
    pub fn is_ham(&self) -> bool {
        SpamStatus::Ham == self.status
    }

    /// The Maildir sub-folder the verdict selects.
    pub fn folder(&self) -> &'static str {
        match self.status {
            SpamStatus::Ham => "",
            SpamStatus::Spam => ".Junk",
        }
    }

    /// The `X-Spam-Status:` header, without the trailing CRLF.
    pub fn header(&self) -> String {
        format!(
            "X-Spam-Status: {}, {}",
            match self.status {
                SpamStatus::Ham => "No",
                SpamStatus::Spam => "Yes",
            },
            self.reasons.join(", "),
        )
    }
}

pub fn classify(
    signals: &Signals<'_>,
    lists_dir: &Path,
    psl: &PublicSuffixList,
) -> SpamVerdict {
    let mut reasons = Vec::<String>::new();
    let white = Cdb::open(lists_dir, "white");

    // SPF fail from an address nobody vouches for is never ham, whatever
    // the other signals say.
    if Some(SpfResult::Fail) == signals.spf_result
        && !signals.ip_whitelisted
    {
        let verdict = SpamVerdict {
            status: SpamStatus::Spam,
            reasons: vec!["SPF fail".to_owned()],
        };
        info!("verdict spam: SPF fail");
        return verdict;
    }

    if Some(SpfResult::Pass) == signals.spf_result {
        if let (Some(domain), Some(ref white)) =
            (signals.spf_domain, &white)
        {
            let registered = psl.registered_domain(domain);
            if white.lookup(domain)
                || registered.as_deref().is_some_and(|rd| white.lookup(rd))
            {
                reasons
                    .push(format!("SPF pass for whitelisted {}", domain));
            }
        }
    }

    if signals.tls {
        // Anything enciphered tastes a lot like ham.
        reasons.push("TLS".to_owned());
    }

    if let Some(identity) = signals.client_identity {
        // The gold standard for naming yourself honestly.
        if signals.fcrdns.iter().any(|n| identity.eq_str(n)) {
            reasons.push("HELO matches FCrDNS".to_owned());
        }
    }

    if let Some(ref white) = white {
        for name in signals.fcrdns {
            let registered = psl.registered_domain(name);
            if white.lookup(name)
                || registered.as_deref().is_some_and(|rd| white.lookup(rd))
            {
                reasons.push(format!("FCrDNS {} whitelisted", name));
                break;
            }
        }
    }

    let verdict = if reasons.is_empty() {
        SpamVerdict {
            status: SpamStatus::Spam,
            reasons: vec!["no ham signals".to_owned()],
        }
    } else {
        SpamVerdict {
            status: SpamStatus::Ham,
            reasons,
        }
    };

    info!(
        "verdict {}: {}",
        match verdict.status {
            SpamStatus::Ham => "ham",
            SpamStatus::Spam => "spam",
        },
        verdict.reasons.join(", "),
    );
    verdict
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::support::cdb::CdbWriter;

    fn lists_dir() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        let mut white = CdbWriter::new();
        white.add("friend.example");
        white.write_to(&dir.path().join("white.cdb"));
        dir
    }

    fn psl() -> PublicSuffixList {
        PublicSuffixList::parse("com\nexample\n")
    }

    fn base_signals<'a>() -> Signals<'a> {
        Signals {
            tls: false,
            client_identity: None,
            fcrdns: &[],
            spf_result: None,
            spf_domain: None,
            ip_whitelisted: false,
        }
    }

    #[test]
    fn tls_is_ham() {
        let dir = lists_dir();
        let signals = Signals {
            tls: true,
            ..base_signals()
        };
        let verdict = classify(&signals, dir.path(), &psl());
        assert!(verdict.is_ham());
        assert_eq!("", verdict.folder());
        assert_eq!("X-Spam-Status: No, TLS", verdict.header());
    }

    #[test]
    fn nothing_is_spam() {
        let dir = lists_dir();
        let verdict = classify(&base_signals(), dir.path(), &psl());
        assert!(!verdict.is_ham());
        assert_eq!(".Junk", verdict.folder());
        assert!(verdict.header().starts_with("X-Spam-Status: Yes"));
    }

    #[test]
    fn helo_matching_fcrdns_is_ham() {
        let dir = lists_dir();
        let identity = Domain::from_name("mail.isp.example").unwrap();
        let fcrdns = vec!["mail.isp.example".to_owned()];
        let signals = Signals {
            client_identity: Some(&identity),
            fcrdns: &fcrdns,
            ..base_signals()
        };
        assert!(classify(&signals, dir.path(), &psl()).is_ham());
    }

    #[test]
    fn whitelisted_fcrdns_is_ham() {
        let dir = lists_dir();
        let fcrdns = vec!["mx.friend.example".to_owned()];
        let signals = Signals {
            fcrdns: &fcrdns,
            ..base_signals()
        };
        let verdict = classify(&signals, dir.path(), &psl());
        assert!(verdict.is_ham());
        assert!(verdict.header().contains("FCrDNS mx.friend.example"));
    }

    #[test]
    fn spf_pass_for_whitelisted_domain_is_ham() {
        let dir = lists_dir();
        let signals = Signals {
            spf_result: Some(SpfResult::Pass),
            spf_domain: Some("mail.friend.example"),
            ..base_signals()
        };
        assert!(classify(&signals, dir.path(), &psl()).is_ham());
    }

    #[test]
    fn spf_fail_overrides_everything() {
        let dir = lists_dir();
        let identity = Domain::from_name("mail.isp.example").unwrap();
        let fcrdns = vec!["mail.isp.example".to_owned()];
        let signals = Signals {
            tls: true,
            client_identity: Some(&identity),
            fcrdns: &fcrdns,
            spf_result: Some(SpfResult::Fail),
            ..base_signals()
        };
        let verdict = classify(&signals, dir.path(), &psl());
        assert!(!verdict.is_ham());
        assert_eq!("X-Spam-Status: Yes, SPF fail", verdict.header());

        // ...except from a whitelisted address.
        let signals = Signals {
            ip_whitelisted: true,
            ..signals
        };
        assert!(classify(&signals, dir.path(), &psl()).is_ham());
    }

    #[test]
    fn reasons_accumulate() {
        let dir = lists_dir();
        let identity = Domain::from_name("mx.friend.example").unwrap();
        let fcrdns = vec!["mx.friend.example".to_owned()];
        let signals = Signals {
            tls: true,
            client_identity: Some(&identity),
            fcrdns: &fcrdns,
            ..base_signals()
        };
        let verdict = classify(&signals, dir.path(), &psl());
        assert!(verdict.is_ham());
        assert_eq!(3, verdict.reasons.len());
    }
}
