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

//! The connection- and envelope-time verification pipeline.
//!
//! Every predicate returns its failure as an `SmtpResponse` for the session
//! to send; none of them write to the wire or exit the process themselves.
//! Connection, client-identity and sender failures are all hostile by
//! policy, so their errors tear the connection down. Recipient problems are
//! graded: an attempt to relay is hostile, a merely unwanted local part is
//! answered and forgiven.

use std::borrow::Cow;
use std::cell::RefCell;
use std::net::IpAddr;
use std::path::Path;
use std::rc::Rc;

use log::{info, warn};
use rand::seq::SliceRandom;

use super::codes::*;
use super::psl::PublicSuffixList;
use super::spf;
use super::syntax::{Domain, Mailbox};
use crate::support::{
    cdb::{lookup_domain, Cdb},
    dns,
    log_prefix::LogPrefix,
    system_config::{SmtpConfig, DNS_TIMEOUT},
};

/// Facts established while greeting the connection, consulted by every
/// later predicate.
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    /// Forward-confirmed reverse DNS names for the peer, shortest first.
    pub fcrdns: Vec<String>,
    pub ip_whitelisted: bool,
    pub fcrdns_whitelisted: bool,
}

/// What the sender checks hand back to the session on success.
#[derive(Debug, Default)]
pub struct SenderInfo {
    pub spf_result: Option<spf::SpfResult>,
    /// The domain the SPF result applies to.
    pub spf_domain: Option<String>,
    pub received_spf: Option<String>,
}

/// Recipient verdicts are graded rather than always fatal.
#[derive(Debug)]
pub enum Verdict {
    Ok,
    /// Reply and stay in the current state.
    Reject(SmtpResponse<'static>),
    /// Reply and terminate the connection.
    Fatal(SmtpResponse<'static>),
}

pub struct Policy<'a> {
    pub config: &'a SmtpConfig,
    pub lists_dir: &'a Path,
    pub psl: &'a PublicSuffixList,
    pub cache: &'a Rc<RefCell<dns::Cache>>,
    pub resolver: Option<&'a Rc<dns::Resolver>>,
    pub log_prefix: &'a LogPrefix,
    pub server_identity: &'a str,
}

impl Policy<'_> {
    /// The connection-time checks: static IP blacklist, FCrDNS resolution
    /// with black/white probing, loopback and static IP whitelists, and
    /// the DNS blocklists.
    ///
    /// On `Err` the session sends the response and exits; the pre-greeting
    /// wait is the session's own job since it owns the socket.
    pub async fn verify_ip_address(
        &self,
        ip: IpAddr,
    ) -> Result<ConnectionInfo, SmtpResponse<'static>> {
        let mut conn = ConnectionInfo::default();

        if let Some(black) = Cdb::open(self.lists_dir, "ip-black") {
            if black.lookup(&ip.to_string()) {
                warn!("{} [{}] blacklisted", self.log_prefix, ip);
                return Err(SmtpResponse(
                    pc::TransactionFailed,
                    Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                    Cow::Borrowed("on my personal blacklist"),
                ));
            }
        }

        let names = match tokio::time::timeout(
            DNS_TIMEOUT,
            dns::fcrdns(self.cache, self.resolver, ip),
        )
        .await
        {
            Ok(names) => names,
            Err(_elapsed) => {
                warn!("{} FCrDNS timed out for {}", self.log_prefix, ip);
                Vec::new()
            },
        };
        conn.fcrdns =
            names.iter().map(|n| dns::name_str(n)).collect::<Vec<_>>();

        let black = Cdb::open(self.lists_dir, "black");
        let white = Cdb::open(self.lists_dir, "white");
        for name in &conn.fcrdns {
            let registered = self.psl.registered_domain(name);

            if let Some(ref black) = black {
                if black.lookup(name)
                    || registered
                        .as_deref()
                        .is_some_and(|rd| black.lookup(rd))
                {
                    warn!(
                        "{} FCrDNS {} blacklisted",
                        self.log_prefix, name,
                    );
                    return Err(SmtpResponse(
                        pc::TransactionFailed,
                        Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                        Cow::Borrowed("blacklisted"),
                    ));
                }
            }

            if let Some(ref white) = white {
                if white.lookup(name)
                    || registered
                        .as_deref()
                        .is_some_and(|rd| white.lookup(rd))
                {
                    info!(
                        "{} FCrDNS {} whitelisted",
                        self.log_prefix, name,
                    );
                    conn.fcrdns_whitelisted = true;
                }
            }
        }

        if ip.is_loopback() {
            conn.ip_whitelisted = true;
            return Ok(conn);
        }

        if let Some(white) = Cdb::open(self.lists_dir, "ip-white") {
            if white.lookup(&ip.to_string()) {
                info!(
                    "{} IP address {} whitelisted",
                    self.log_prefix, ip,
                );
                conn.ip_whitelisted = true;
                return Ok(conn);
            }
        }

        if let IpAddr::V4(ip4) = ip {
            // <https://en.wikipedia.org/wiki/DNSBL>; probe order is
            // shuffled so no single list sees every connection first.
            let reversed = {
                let o = ip4.octets();
                format!("{}.{}.{}.{}", o[3], o[2], o[1], o[0])
            };

            let mut rbls = self.config.rbls.iter().collect::<Vec<_>>();
            rbls.shuffle(&mut rand::thread_rng());

            for rbl in rbls {
                if self.has_a_record(&format!("{}.{}", reversed, rbl)).await
                {
                    warn!("{} [{}] blocked by {}", self.log_prefix, ip, rbl);
                    return Err(SmtpResponse(
                        pc::TransactionFailed,
                        Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                        Cow::Owned(format!("blocked on advice from {}", rbl)),
                    ));
                }
            }
        }

        Ok(conn)
    }

    /// Judges the identity claimed in HELO/EHLO.
    pub fn verify_client(
        &self,
        client_identity: &Domain,
        conn: &ConnectionInfo,
        peer: Option<IpAddr>,
    ) -> Result<(), SmtpResponse<'static>> {
        let Some(peer) = peer else {
            return Ok(());
        };
        if conn.ip_whitelisted
            || conn.fcrdns_whitelisted
            || client_identity.is_address_literal()
        {
            return Ok(());
        }

        // Bogus clients claim to be us or some local host.
        if client_identity.eq_str(self.server_identity)
            || client_identity.eq_str("localhost")
            || client_identity.eq_str("localhost.localdomain")
        {
            let fcrdns_is_us = conn
                .fcrdns
                .iter()
                .any(|n| n.eq_ignore_ascii_case(self.server_identity));
            if !peer.is_loopback() && !fcrdns_is_us {
                warn!(
                    "{} liar: claims to be {}",
                    self.log_prefix, client_identity,
                );
                return Err(SmtpResponse(
                    pc::ActionNotTakenPermanent,
                    Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                    Cow::Borrowed("liar"),
                ));
            }
        }

        if client_identity.labels().count() < 2 {
            warn!(
                "{} bogus client identity {}",
                self.log_prefix, client_identity,
            );
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                Cow::Borrowed("invalid client identity"),
            ));
        }

        if let Some(black) = Cdb::open(self.lists_dir, "black") {
            if lookup_domain(&black, client_identity) {
                warn!(
                    "{} blacklisted identity {}",
                    self.log_prefix, client_identity,
                );
                return Err(SmtpResponse(
                    pc::ActionNotTakenPermanent,
                    Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                    Cow::Borrowed("blacklisted identity"),
                ));
            }

            if let Some(registered) =
                self.psl.registered_domain(client_identity.ascii())
            {
                if black.lookup(&registered) {
                    warn!(
                        "{} blacklisted domain {}",
                        self.log_prefix, registered,
                    );
                    return Err(SmtpResponse(
                        pc::ActionNotTakenPermanent,
                        Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                        Cow::Borrowed("blacklisted domain"),
                    ));
                }
            }
        }

        Ok(())
    }

    /// The MAIL FROM checks: bad-sender list, anti-spoofing, the
    /// URIBL-backed domain chain, then SPF.
    pub async fn verify_sender(
        &self,
        sender: Option<&Mailbox>,
        client_identity: &Domain,
        conn: &ConnectionInfo,
        peer: Option<IpAddr>,
        them_literal: &str,
    ) -> Result<SenderInfo, SmtpResponse<'static>> {
        if let Some(sender) = sender {
            if let Some(bad) = Cdb::open(self.lists_dir, "bad_senders") {
                if bad.lookup(&sender.local) {
                    warn!("{} bad sender {}", self.log_prefix, sender);
                    return Err(SmtpResponse(
                        pc::ActionNotTakenPermanent,
                        Some((cc::PermFail, sc::BadSenderSystemAddress)),
                        Cow::Borrowed("bad sender"),
                    ));
                }
            }

            if sender.domain.is_address_literal() {
                // A mismatch here is suspicious but common enough among
                // misconfigured but legitimate senders to forgive.
                if !sender.domain.eq_str(them_literal) {
                    warn!(
                        "{} sender domain {} does not match {}",
                        self.log_prefix, sender.domain, them_literal,
                    );
                }
            } else {
                if self.domain_is_accepted(&sender.domain)
                    && !peer.is_some_and(|ip| ip.is_loopback())
                {
                    warn!(
                        "{} spoofed sender domain {}",
                        self.log_prefix, sender.domain,
                    );
                    return Err(SmtpResponse(
                        pc::ActionNotTakenPermanent,
                        Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                        Cow::Borrowed("bad sender domain"),
                    ));
                }

                // If the reverse path domain matches the FCrDNS of the
                // sending address, skip the URIBL chain.
                let matches_fcrdns = conn
                    .fcrdns
                    .iter()
                    .any(|n| sender.domain.eq_str(n));
                if !matches_fcrdns {
                    self.verify_sender_domain(&sender.domain).await?;
                }
            }
        }

        let Some(peer) = peer else {
            return Ok(SenderInfo::default());
        };

        self.verify_sender_spf(sender, client_identity, conn, peer).await
    }

    async fn verify_sender_spf(
        &self,
        sender: Option<&Mailbox>,
        client_identity: &Domain,
        conn: &ConnectionInfo,
        peer: IpAddr,
    ) -> Result<SenderInfo, SmtpResponse<'static>> {
        let sender_string = sender.map(|s| s.to_string());
        let sender_domain = sender
            .filter(|s| !s.domain.is_empty() && !s.domain.is_address_literal())
            .map(|s| s.domain.ascii().to_owned());

        let ctx = spf::Context {
            sender: sender_string.as_deref().map(Cow::Borrowed),
            sender_local: sender.map(|s| Cow::Borrowed(s.local.as_str())),
            sender_domain: Cow::Owned(
                sender_domain
                    .clone()
                    .unwrap_or_else(|| client_identity.ascii().to_owned()),
            ),
            helo_domain: Cow::Borrowed(client_identity.ascii()),
            ip: peer,
            receiver_host: Cow::Borrowed(self.server_identity),
        };

        if ctx.sender_domain.is_empty() {
            return Ok(SenderInfo::default());
        }

        let outcome = if conn.ip_whitelisted || peer.is_loopback() {
            spf::whitelisted_outcome(&ctx)
        } else {
            spf::run(
                &ctx,
                self.cache,
                self.resolver,
                tokio::time::Instant::now() + DNS_TIMEOUT,
            )
            .await
        };

        info!(
            "{} SPF {} for {}",
            self.log_prefix, outcome.result, outcome.domain,
        );

        if spf::SpfResult::Fail == outcome.result {
            let blacklisted = Cdb::open(self.lists_dir, "black")
                .is_some_and(|black| black.lookup(&outcome.domain));

            if blacklisted || self.config.reject_spf_fail {
                return Err(SmtpResponse(
                    pc::ActionNotTakenPermanent,
                    Some((cc::PermFail, sc::SpfValidationFailure)),
                    Cow::Owned(outcome.comment.clone()),
                ));
            }
        }

        let header = outcome.received_spf(&ctx);
        Ok(SenderInfo {
            spf_result: Some(outcome.result),
            spf_domain: Some(outcome.domain),
            received_spf: Some(header),
        })
    }

    /// The sender-domain chain: whitelists, syntactic sanity, registered
    /// domain, the two/three-level-tld candidate derivation, then the
    /// URIBLs.
    async fn verify_sender_domain(
        &self,
        sender: &Domain,
    ) -> Result<(), SmtpResponse<'static>> {
        if sender.is_empty() {
            // MAIL FROM:<> is used to send bounce messages.
            return Ok(());
        }

        let domain = sender.ascii().to_owned();
        let white = Cdb::open(self.lists_dir, "white");

        if let Some(ref white) = white {
            if lookup_domain(white, sender) {
                info!("{} sender {} whitelisted", self.log_prefix, domain);
                return Ok(());
            }
        }

        let labels = domain.split('.').collect::<Vec<_>>();
        if labels.len() < 2 {
            warn!("{} sender {} invalid syntax", self.log_prefix, domain);
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                Cow::Owned(format!("invalid sender domain {}", domain)),
            ));
        }

        let Some(registered) = self.psl.registered_domain(&domain) else {
            warn!(
                "{} sender {} has no registered domain",
                self.log_prefix, domain,
            );
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                Cow::Owned(format!("invalid sender domain {}", domain)),
            ));
        };

        if let Some(ref white) = white {
            if white.lookup(&registered) {
                info!(
                    "{} sender domain {} whitelisted",
                    self.log_prefix, registered,
                );
                return Ok(());
            }
        }

        // Candidate derivation based on <http://www.surbl.org/guidelines>.
        let two_level = labels[labels.len() - 2..].join(".");

        if labels.len() > 2 {
            let three_level = labels[labels.len() - 3..].join(".");
            if Cdb::open(self.lists_dir, "three-level-tlds")
                .is_some_and(|tlds| tlds.lookup(&three_level))
            {
                if labels.len() > 3 {
                    let candidate = labels[labels.len() - 4..].join(".");
                    return self.verify_sender_domain_uribl(&candidate).await;
                }
                warn!(
                    "{} sender {} exactly matches three-level-tlds",
                    self.log_prefix, domain,
                );
                return Err(SmtpResponse(
                    pc::TransactionFailed,
                    Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                    Cow::Borrowed("bad sender domain"),
                ));
            }
        }

        if Cdb::open(self.lists_dir, "two-level-tlds")
            .is_some_and(|tlds| tlds.lookup(&two_level))
        {
            if labels.len() > 2 {
                let candidate = labels[labels.len() - 3..].join(".");
                return self.verify_sender_domain_uribl(&candidate).await;
            }
            warn!(
                "{} sender {} exactly matches two-level-tlds",
                self.log_prefix, domain,
            );
            return Err(SmtpResponse(
                pc::TransactionFailed,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                Cow::Borrowed("bad sender domain"),
            ));
        }

        self.verify_sender_domain_uribl(&registered).await
    }

    async fn verify_sender_domain_uribl(
        &self,
        candidate: &str,
    ) -> Result<(), SmtpResponse<'static>> {
        let mut uribls = self.config.uribls.iter().collect::<Vec<_>>();
        uribls.shuffle(&mut rand::thread_rng());

        for uribl in uribls {
            let name = format!("{}.{}", candidate, uribl);
            let Ok(name) = dns::Name::from_utf8(&name) else {
                continue;
            };
            let addrs = match tokio::time::timeout(
                DNS_TIMEOUT,
                dns::lookup_a(self.cache, self.resolver, &name),
            )
            .await
            {
                Ok(Ok(addrs)) => addrs,
                _ => continue,
            };

            // 127.0.0.1 is the "not listed / query refused" sentinel some
            // lists return to over-quota clients.
            if !addrs.is_empty()
                && !addrs.iter().all(|a| a.is_loopback())
            {
                warn!(
                    "{} {} blocked by {}",
                    self.log_prefix, candidate, uribl,
                );
                return Err(SmtpResponse(
                    pc::ActionNotTakenPermanent,
                    Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                    Cow::Owned(format!(
                        "sender blocked on advice of {}",
                        uribl,
                    )),
                ));
            }
        }

        info!("{} {} cleared by URIBLs", self.log_prefix, candidate);
        Ok(())
    }

    /// The RCPT TO checks.
    pub fn verify_recipient(
        &self,
        recipient: &Mailbox,
        us_literal: &str,
    ) -> Verdict {
        if recipient.is_magic_postmaster() {
            info!("{} magic Postmaster address", self.log_prefix);
            return Verdict::Ok;
        }

        let accepted = if recipient.domain.is_address_literal() {
            recipient.domain.eq_str(us_literal)
        } else {
            self.domain_is_accepted(&recipient.domain)
        };

        if !accepted {
            warn!(
                "{} relay access denied for domain {}",
                self.log_prefix, recipient.domain,
            );
            return Verdict::Fatal(SmtpResponse(
                pc::TransactionFailed,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                Cow::Borrowed("relay access denied"),
            ));
        }

        if let Some(bad) = Cdb::open(self.lists_dir, "bad_recipients") {
            if bad.lookup(&recipient.local) {
                warn!("{} bad recipient {}", self.log_prefix, recipient);
                return Verdict::Reject(SmtpResponse(
                    pc::ActionNotTakenPermanent,
                    Some((cc::PermFail, sc::BadDestinationMailboxAddress)),
                    Cow::Owned(format!("bad recipient {}", recipient)),
                ));
            }
        }

        Verdict::Ok
    }

    /// Whether we accept mail addressed to `domain`.
    ///
    /// An openable `accept_domains.cdb` is authoritative even when empty;
    /// only a missing file falls back to comparing against the server
    /// identity.
    pub fn domain_is_accepted(&self, domain: &Domain) -> bool {
        match Cdb::open(self.lists_dir, "accept_domains") {
            Some(accept) => lookup_domain(&accept, domain),
            None => domain.eq_str(self.server_identity),
        }
    }

    async fn has_a_record(&self, name: &str) -> bool {
        let Ok(name) = dns::Name::from_utf8(name) else {
            return false;
        };
        matches!(
            tokio::time::timeout(
                DNS_TIMEOUT,
                dns::lookup_a(self.cache, self.resolver, &name),
            )
            .await,
            Ok(Ok(ref addrs)) if !addrs.is_empty()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::support::cdb::CdbWriter;
    use crate::support::dns::{Cache, Entry};

    struct Fixture {
        dir: tempfile::TempDir,
        config: SmtpConfig,
        psl: PublicSuffixList,
        cache: Rc<RefCell<Cache>>,
        log_prefix: LogPrefix,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::TempDir::new().unwrap();

            let mut white = CdbWriter::new();
            white.add("friend.example");
            white.add("trusted.example.com");
            white.write_to(&dir.path().join("white.cdb"));

            let mut black = CdbWriter::new();
            black.add("evil.example");
            black.write_to(&dir.path().join("black.cdb"));

            let mut accept = CdbWriter::new();
            accept.add("ourdomain.example");
            accept.write_to(&dir.path().join("accept_domains.cdb"));

            let mut bad_rcpt = CdbWriter::new();
            bad_rcpt.add("mixmaster");
            bad_rcpt.write_to(&dir.path().join("bad_recipients.cdb"));

            let mut bad_send = CdbWriter::new();
            bad_send.add("spammer");
            bad_send.write_to(&dir.path().join("bad_senders.cdb"));

            let mut two_tlds = CdbWriter::new();
            two_tlds.add("co.example");
            two_tlds.write_to(&dir.path().join("two-level-tlds.cdb"));

            Self {
                dir,
                config: SmtpConfig::default(),
                psl: PublicSuffixList::parse("com\nexample\nexample.org\n"),
                cache: Rc::new(RefCell::new(Cache::default())),
                log_prefix: LogPrefix::new("test".to_owned()),
            }
        }

        fn policy(&self) -> Policy<'_> {
            Policy {
                config: &self.config,
                lists_dir: self.dir.path(),
                psl: &self.psl,
                cache: &self.cache,
                resolver: None,
                log_prefix: &self.log_prefix,
                server_identity: "mx.ourdomain.example",
            }
        }
    }

    fn run_local<F: std::future::Future>(f: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        rt.block_on(local.run_until(f))
    }

    fn domain(s: &str) -> Domain {
        Domain::from_name(s).unwrap()
    }

    fn mailbox(s: &str) -> Mailbox {
        let (local, dom) = s.rsplit_once('@').unwrap();
        Mailbox {
            local: local.to_owned(),
            domain: domain(dom),
        }
    }

    #[test]
    fn recipient_checks() {
        let fixture = Fixture::new();
        let policy = fixture.policy();

        assert!(matches!(
            policy.verify_recipient(
                &mailbox("user@ourdomain.example"),
                "[192.0.2.1]",
            ),
            Verdict::Ok,
        ));

        assert!(matches!(
            policy.verify_recipient(&Mailbox::postmaster(), "[192.0.2.1]"),
            Verdict::Ok,
        ));

        // Unknown domain: that's a relay attempt.
        assert!(matches!(
            policy.verify_recipient(
                &mailbox("user@elsewhere.example"),
                "[192.0.2.1]",
            ),
            Verdict::Fatal(_),
        ));

        // Bad local part in an accepted domain is rejected but survivable.
        assert!(matches!(
            policy.verify_recipient(
                &mailbox("mixmaster@ourdomain.example"),
                "[192.0.2.1]",
            ),
            Verdict::Reject(_),
        ));

        // Our own address literal is deliverable; any other is relaying.
        let lit = literal_recipient("[192.0.2.1]");
        assert!(matches!(
            policy.verify_recipient(&lit, "[192.0.2.1]"),
            Verdict::Ok,
        ));
        let lit = literal_recipient("[198.51.100.7]");
        assert!(matches!(
            policy.verify_recipient(&lit, "[192.0.2.1]"),
            Verdict::Fatal(_),
        ));
    }

    // Builds a recipient with an address-literal domain via the grammar.
    fn literal_recipient(lit: &str) -> Mailbox {
        use super::super::syntax::Command;
        match Command::parse(&format!("RCPT TO:<postmaster@{}>", lit)) {
            Ok(Command::RcptTo(mailbox, _)) => mailbox,
            wat => panic!("unexpected parse: {:?}", wat),
        }
    }

    #[test]
    fn client_checks() {
        let fixture = Fixture::new();
        let policy = fixture.policy();
        let conn = ConnectionInfo::default();
        let peer = Some("192.0.2.3".parse().unwrap());

        assert!(policy
            .verify_client(&domain("mail.friend.example"), &conn, peer)
            .is_ok());

        // Claiming to be us from a non-loopback, non-FCrDNS peer.
        assert!(policy
            .verify_client(&domain("mx.ourdomain.example"), &conn, peer)
            .is_err());
        assert!(policy
            .verify_client(&domain("localhost"), &conn, peer)
            .is_err());

        // ...but loopback may.
        assert!(policy
            .verify_client(
                &domain("localhost"),
                &conn,
                Some("127.0.0.1".parse().unwrap()),
            )
            .is_ok());

        // ...as may a peer whose FCrDNS is us.
        let conn_us = ConnectionInfo {
            fcrdns: vec!["mx.ourdomain.example".to_owned()],
            ..ConnectionInfo::default()
        };
        assert!(policy
            .verify_client(&domain("mx.ourdomain.example"), &conn_us, peer)
            .is_ok());

        // Single-label identities are bogus.
        assert!(policy
            .verify_client(&domain("desktop"), &conn, peer)
            .is_err());

        // Blacklisted identities are refused.
        assert!(policy
            .verify_client(&domain("mail.evil.example"), &conn, peer)
            .is_err());

        // Whitelisted connections skip all of it.
        let conn_white = ConnectionInfo {
            ip_whitelisted: true,
            ..ConnectionInfo::default()
        };
        assert!(policy
            .verify_client(&domain("desktop"), &conn_white, peer)
            .is_ok());
    }

    #[test]
    fn sender_domain_chain() {
        run_local(async {
            let fixture = Fixture::new();

            // URIBL data: spam.example is listed, ham.example is not, and
            // refused.example gets the 127.0.0.1 sentinel.
            {
                let mut cache = fixture.cache.borrow_mut();
                for uribl in &fixture.config.uribls {
                    cache.a.push((
                        Rc::new(
                            dns::Name::from_ascii(format!(
                                "spam.example.{}",
                                uribl,
                            ))
                            .unwrap(),
                        ),
                        Entry::Ok(vec!["127.0.0.2".parse().unwrap()]),
                    ));
                    cache.a.push((
                        Rc::new(
                            dns::Name::from_ascii(format!(
                                "ham.example.{}",
                                uribl,
                            ))
                            .unwrap(),
                        ),
                        Entry::NotFound,
                    ));
                    cache.a.push((
                        Rc::new(
                            dns::Name::from_ascii(format!(
                                "refused.example.{}",
                                uribl,
                            ))
                            .unwrap(),
                        ),
                        Entry::Ok(vec!["127.0.0.1".parse().unwrap()]),
                    ));
                }
            }

            let policy = fixture.policy();

            assert!(policy
                .verify_sender_domain(&domain("ham.example"))
                .await
                .is_ok());
            assert!(policy
                .verify_sender_domain(&domain("mail.spam.example"))
                .await
                .is_err());
            // The whitelist short-circuits the URIBL probe entirely.
            assert!(policy
                .verify_sender_domain(&domain("friend.example"))
                .await
                .is_ok());
            assert!(policy
                .verify_sender_domain(&domain("trusted.example.com"))
                .await
                .is_ok());
            // 127.0.0.1 answers do not count as listings.
            assert!(policy
                .verify_sender_domain(&domain("refused.example"))
                .await
                .is_ok());
            // A single label is not a domain.
            assert!(policy
                .verify_sender_domain(&domain("localname"))
                .await
                .is_err());
            // A bare public suffix has no registered domain.
            assert!(policy
                .verify_sender_domain(&domain("example.org"))
                .await
                .is_err());
        });
    }

    #[test]
    fn two_level_tld_candidates() {
        run_local(async {
            let fixture = Fixture::new();

            // host.co.example should be probed as host.co.example (three
            // labels against the two-level-tlds entry co.example), not as
            // the registered domain.
            {
                let mut cache = fixture.cache.borrow_mut();
                for uribl in &fixture.config.uribls {
                    cache.a.push((
                        Rc::new(
                            dns::Name::from_ascii(format!(
                                "host.co.example.{}",
                                uribl,
                            ))
                            .unwrap(),
                        ),
                        Entry::Ok(vec!["127.0.0.2".parse().unwrap()]),
                    ));
                }
            }

            let policy = fixture.policy();
            assert!(policy
                .verify_sender_domain(&domain("deep.host.co.example"))
                .await
                .is_err());

            // An exact match on the tlds list with no deeper labels is
            // itself a reject.
            assert!(policy
                .verify_sender_domain(&domain("co.example"))
                .await
                .is_err());
        });
    }

    #[test]
    fn spoofed_sender_rejected() {
        run_local(async {
            let fixture = Fixture::new();
            let policy = fixture.policy();
            let conn = ConnectionInfo::default();

            let err = policy
                .verify_sender(
                    Some(&mailbox("ceo@ourdomain.example")),
                    &domain("mail.elsewhere.example"),
                    &conn,
                    Some("192.0.2.3".parse().unwrap()),
                    "[192.0.2.3]",
                )
                .await;
            assert!(err.is_err());
        });
    }

    #[test]
    fn bad_sender_local_part() {
        run_local(async {
            let fixture = Fixture::new();
            let policy = fixture.policy();
            let conn = ConnectionInfo::default();

            let err = policy
                .verify_sender(
                    Some(&mailbox("spammer@friend.example")),
                    &domain("mail.friend.example"),
                    &conn,
                    Some("192.0.2.3".parse().unwrap()),
                    "[192.0.2.3]",
                )
                .await;
            assert!(err.is_err());
        });
    }

    #[test]
    fn whitelisted_peer_gets_synthetic_spf_pass() {
        run_local(async {
            let fixture = Fixture::new();
            let policy = fixture.policy();
            let conn = ConnectionInfo {
                ip_whitelisted: true,
                ..ConnectionInfo::default()
            };

            let info = policy
                .verify_sender(
                    Some(&mailbox("u@friend.example")),
                    &domain("mail.friend.example"),
                    &conn,
                    Some("192.0.2.3".parse().unwrap()),
                    "[192.0.2.3]",
                )
                .await
                .unwrap();
            assert_eq!(Some(spf::SpfResult::Pass), info.spf_result);
            assert!(info
                .received_spf
                .as_deref()
                .unwrap()
                .contains("192.0.2.3 is whitelisted"));
        });
    }
}
