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

//! SPF evaluation (RFC 7208), reduced to what the inbound policy check
//! consumes: a result, the authenticated domain, and the text of the
//! `Received-SPF:` header.
//!
//! Mechanisms `all`, `include`, `a`, `mx`, `ptr`, `ip4`, `ip6` and
//! `exists` are implemented, as are `redirect=` and the macro letters
//! s/l/o/d/i/v/h with the digit/`r`/delimiter transformers. `exp=` is
//! recognised but the explanation record is not chased; the result never
//! depends on it. `%{p}` expands to `unknown`, which RFC 7208 § 7.3
//! explicitly sanctions.

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::rc::Rc;

use log::warn;

use crate::support::dns;

/// RFC 7208 § 8.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpfResult {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Self::None => "none",
            Self::Neutral => "neutral",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        })
    }
}

pub struct Context<'a> {
    /// The full MAIL FROM address, if there was a local part.
    pub sender: Option<Cow<'a, str>>,
    pub sender_local: Option<Cow<'a, str>>,
    /// The domain whose policy is being checked, in lowercased ASCII form.
    pub sender_domain: Cow<'a, str>,
    pub helo_domain: Cow<'a, str>,
    pub ip: IpAddr,
    pub receiver_host: Cow<'a, str>,
}

#[derive(Clone, Debug)]
pub struct SpfOutcome {
    pub result: SpfResult,
    /// The domain the result applies to.
    pub domain: String,
    /// Human-readable elaboration, used in the header comment and in the
    /// 550 reply when SPF failures are configured to be fatal.
    pub comment: String,
}

impl SpfOutcome {
    /// The complete `Received-SPF:` header (RFC 7208 § 9.1), without the
    /// trailing CRLF.
    pub fn received_spf(&self, ctx: &Context<'_>) -> String {
        format!(
            "Received-SPF: {result} ({receiver}: {comment}) \
             client-ip={ip}; envelope-from={from}; helo={helo};",
            result = self.result,
            receiver = ctx.receiver_host,
            comment = self.comment,
            ip = ctx.ip,
            from = ctx.sender.as_deref().unwrap_or(""),
            helo = ctx.helo_domain,
        )
    }
}

/// Runs `check_host()` for the context's sender domain.
///
/// DNS lookups run against the shared session cache; `deadline` bounds the
/// whole evaluation, yielding `temperror` when it passes.
pub async fn run(
    ctx: &Context<'_>,
    cache: &Rc<RefCell<dns::Cache>>,
    resolver: Option<&Rc<dns::Resolver>>,
    deadline: tokio::time::Instant,
) -> SpfOutcome {
    let eval = Eval {
        ctx,
        cache,
        resolver,
        lookups: Cell::new(0),
    };

    let domain = ctx.sender_domain.to_string();
    let result =
        match tokio::time::timeout_at(deadline, eval.check(domain.clone()))
            .await
        {
            Ok(result) => result,
            Err(_elapsed) => SpfResult::TempError,
        };

    let comment = match result {
        SpfResult::Pass => format!(
            "domain of {} designates {} as permitted sender",
            domain, ctx.ip,
        ),
        SpfResult::Fail => format!(
            "domain of {} does not designate {} as permitted sender",
            domain, ctx.ip,
        ),
        SpfResult::SoftFail => format!(
            "domain of transitioning {} discourages use of {} as permitted \
             sender",
            domain, ctx.ip,
        ),
        SpfResult::Neutral => format!(
            "{} is neither permitted nor denied by domain of {}",
            ctx.ip, domain,
        ),
        SpfResult::None => {
            format!("domain of {} does not provide an SPF record", domain)
        },
        SpfResult::TempError | SpfResult::PermError => {
            format!("error in processing during lookup of {}", domain)
        },
    };

    SpfOutcome {
        result,
        domain,
        comment,
    }
}

/// Synthesises a `pass` outcome for peers we trust without consulting DNS
/// (loopback and whitelisted addresses).
pub fn whitelisted_outcome(ctx: &Context<'_>) -> SpfOutcome {
    SpfOutcome {
        result: SpfResult::Pass,
        domain: ctx.sender_domain.to_string(),
        comment: format!("{} is whitelisted", ctx.ip),
    }
}

const MAX_DNS_MECHANISMS: u32 = 10;
const MAX_MX_RECORDS: usize = 10;

struct Eval<'a> {
    ctx: &'a Context<'a>,
    cache: &'a Rc<RefCell<dns::Cache>>,
    resolver: Option<&'a Rc<dns::Resolver>>,
    lookups: Cell<u32>,
}

impl Eval<'_> {
    /// `check_host()` from RFC 7208 § 4, recursing for `include` and
    /// `redirect`.
    fn check<'s>(
        &'s self,
        domain: String,
    ) -> Pin<Box<dyn Future<Output = SpfResult> + 's>> {
        Box::pin(async move {
            let Ok(name) = dns::Name::from_utf8(&domain) else {
                return SpfResult::PermError;
            };

            let records =
                match dns::lookup_txt(self.cache, self.resolver, &name)
                    .await
                {
                    Ok(records) => records,
                    Err(dns::CacheError::NotFound) => Vec::new(),
                    Err(_) => return SpfResult::TempError,
                };

            let mut spf_records = records.iter().filter(|r| {
                "v=spf1".eq_ignore_ascii_case(r)
                    || r.len() >= 7
                        && r[..7].eq_ignore_ascii_case("v=spf1 ")
            });

            let Some(record) = spf_records.next() else {
                return SpfResult::None;
            };
            if spf_records.next().is_some() {
                // RFC 7208 § 4.5: multiple records is an error.
                return SpfResult::PermError;
            }
            let record = Rc::clone(record);

            let mut redirect = None::<String>;
            for word in record.split(' ').filter(|w| !w.is_empty()).skip(1) {
                let term = match Term::parse(word) {
                    Ok(term) => term,
                    Err(()) => return SpfResult::PermError,
                };

                match term {
                    Term::Directive(qualifier, mechanism) => {
                        match self.matches(&mechanism, &domain).await {
                            Ok(true) => return qualifier.result(),
                            Ok(false) => (),
                            Err(e) => return e,
                        }
                    },
                    Term::Redirect(target) => redirect = Some(target),
                    Term::Exp(_) | Term::Unknown => (),
                }
            }

            if let Some(target) = redirect {
                if self.tally_lookup().is_err() {
                    return SpfResult::PermError;
                }
                let Ok(target) = self.expand(&target, &domain) else {
                    return SpfResult::PermError;
                };
                return match self.check(target).await {
                    // A missing record at the redirect target is an error
                    // in the referring record.
                    SpfResult::None => SpfResult::PermError,
                    r => r,
                };
            }

            SpfResult::Neutral
        })
    }

    async fn matches(
        &self,
        mechanism: &Mechanism,
        domain: &str,
    ) -> Result<bool, SpfResult> {
        match *mechanism {
            Mechanism::All => Ok(true),

            Mechanism::Ip4(net, len) => Ok(match self.ctx.ip {
                IpAddr::V4(ip) => v4_match(ip, net, len),
                IpAddr::V6(_) => false,
            }),

            Mechanism::Ip6(net, len) => Ok(match self.ctx.ip {
                IpAddr::V6(ip) => v6_match(ip, net, len),
                IpAddr::V4(_) => false,
            }),

            Mechanism::A {
                domain: ref target,
                v4,
                v6,
            } => {
                self.tally_lookup()?;
                let target = self.target_name(target.as_deref(), domain)?;
                self.ip_matches_a(&target, v4, v6).await
            },

            Mechanism::Mx {
                domain: ref target,
                v4,
                v6,
            } => {
                self.tally_lookup()?;
                let target = self.target_name(target.as_deref(), domain)?;
                let name = parse_name(&target)?;
                let mxes =
                    match dns::lookup_mx(self.cache, self.resolver, &name)
                        .await
                    {
                        Ok(mxes) => mxes,
                        Err(dns::CacheError::NotFound) => return Ok(false),
                        Err(_) => return Err(SpfResult::TempError),
                    };
                if mxes.len() > MAX_MX_RECORDS {
                    return Err(SpfResult::PermError);
                }

                for mx in mxes {
                    if self
                        .ip_matches_a(&dns::name_str(&mx), v4, v6)
                        .await?
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            },

            Mechanism::Ptr(ref target) => {
                self.tally_lookup()?;
                let target = self.target_name(target.as_deref(), domain)?;
                let target = target.to_lowercase();
                let names =
                    dns::fcrdns(self.cache, self.resolver, self.ctx.ip)
                        .await;
                Ok(names.iter().any(|n| {
                    let n = dns::name_str(n);
                    n == target || n.ends_with(&format!(".{}", target))
                }))
            },

            Mechanism::Exists(ref target) => {
                self.tally_lookup()?;
                let target = self.expand(target, domain)
                    .map_err(|()| SpfResult::PermError)?;
                let name = parse_name(&target)?;
                match dns::lookup_a(self.cache, self.resolver, &name).await
                {
                    Ok(addrs) => Ok(!addrs.is_empty()),
                    Err(dns::CacheError::NotFound) => Ok(false),
                    Err(_) => Err(SpfResult::TempError),
                }
            },

            Mechanism::Include(ref target) => {
                self.tally_lookup()?;
                let target = self.expand(target, domain)
                    .map_err(|()| SpfResult::PermError)?;
                match self.check(target).await {
                    SpfResult::Pass => Ok(true),
                    SpfResult::Fail
                    | SpfResult::SoftFail
                    | SpfResult::Neutral => Ok(false),
                    SpfResult::TempError => Err(SpfResult::TempError),
                    SpfResult::PermError | SpfResult::None => {
                        Err(SpfResult::PermError)
                    },
                }
            },
        }
    }

    async fn ip_matches_a(
        &self,
        target: &str,
        v4: u8,
        v6: u8,
    ) -> Result<bool, SpfResult> {
        let name = parse_name(target)?;
        match self.ctx.ip {
            IpAddr::V4(ip) => {
                match dns::lookup_a(self.cache, self.resolver, &name).await
                {
                    Ok(addrs) => {
                        Ok(addrs.iter().any(|&a| v4_match(ip, a, v4)))
                    },
                    Err(dns::CacheError::NotFound) => Ok(false),
                    Err(_) => Err(SpfResult::TempError),
                }
            },
            IpAddr::V6(ip) => {
                match dns::lookup_aaaa(self.cache, self.resolver, &name)
                    .await
                {
                    Ok(addrs) => {
                        Ok(addrs.iter().any(|&a| v6_match(ip, a, v6)))
                    },
                    Err(dns::CacheError::NotFound) => Ok(false),
                    Err(_) => Err(SpfResult::TempError),
                }
            },
        }
    }

    fn target_name(
        &self,
        target: Option<&str>,
        domain: &str,
    ) -> Result<String, SpfResult> {
        match target {
            Some(spec) => {
                self.expand(spec, domain).map_err(|()| SpfResult::PermError)
            },
            None => Ok(domain.to_owned()),
        }
    }

    fn tally_lookup(&self) -> Result<(), SpfResult> {
        let n = self.lookups.get() + 1;
        self.lookups.set(n);
        if n > MAX_DNS_MECHANISMS {
            warn!("SPF record exceeds {} DNS lookups", MAX_DNS_MECHANISMS);
            Err(SpfResult::PermError)
        } else {
            Ok(())
        }
    }

    /// Macro-string expansion, RFC 7208 § 7.
    fn expand(&self, spec: &str, domain: &str) -> Result<String, ()> {
        let mut out = String::new();
        let mut chars = spec.chars();

        while let Some(c) = chars.next() {
            if '%' != c {
                out.push(c);
                continue;
            }

            match chars.next() {
                Some('%') => out.push('%'),
                Some('_') => out.push(' '),
                Some('-') => out.push_str("%20"),
                Some('{') => {
                    let mut body = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => body.push(c),
                            None => return Err(()),
                        }
                    }
                    out.push_str(&self.expand_macro(&body, domain)?);
                },
                _ => return Err(()),
            }
        }

        Ok(out)
    }

    fn expand_macro(&self, body: &str, domain: &str) -> Result<String, ()> {
        let mut chars = body.chars();
        let letter = chars.next().ok_or(())?;

        let value: String = match letter.to_ascii_lowercase() {
            's' => match self.ctx.sender {
                Some(ref s) => s.to_string(),
                None => format!("postmaster@{}", self.ctx.helo_domain),
            },
            'l' => self
                .ctx
                .sender_local
                .as_deref()
                .unwrap_or("postmaster")
                .to_owned(),
            'o' => self.ctx.sender_domain.to_string(),
            'd' => domain.to_owned(),
            'i' => match self.ctx.ip {
                IpAddr::V4(ip) => ip.to_string(),
                IpAddr::V6(ip) => {
                    // "dot-format" of the address: one hex nibble per
                    // label.
                    let mut s = String::with_capacity(63);
                    for octet in ip.octets() {
                        if !s.is_empty() {
                            s.push('.');
                        }
                        s.push(
                            char::from_digit((octet >> 4).into(), 16)
                                .unwrap(),
                        );
                        s.push('.');
                        s.push(
                            char::from_digit((octet & 0xF).into(), 16)
                                .unwrap(),
                        );
                    }
                    s
                },
            },
            'v' => match self.ctx.ip {
                IpAddr::V4(_) => "in-addr".to_owned(),
                IpAddr::V6(_) => "ip6".to_owned(),
            },
            'h' => self.ctx.helo_domain.to_string(),
            // § 7.3: "unknown" is an acceptable expansion.
            'p' => "unknown".to_owned(),
            _ => return Err(()),
        };

        // Transformers: digits, 'r', then delimiter set.
        let rest = chars.as_str();
        let digits_end = rest
            .char_indices()
            .find(|&(_, c)| !c.is_ascii_digit())
            .map(|(ix, _)| ix)
            .unwrap_or(rest.len());
        let keep = if 0 == digits_end {
            None
        } else {
            Some(rest[..digits_end].parse::<usize>().map_err(|_| ())?)
        };
        let mut rest = &rest[digits_end..];
        let reverse = rest.starts_with('r') || rest.starts_with('R');
        if reverse {
            rest = &rest[1..];
        }
        let delimiters = if rest.is_empty() { "." } else { rest };
        if !rest.chars().all(|c| ".-+,/_=".contains(c)) {
            return Err(());
        }

        let mut parts = value
            .split(|c| delimiters.contains(c))
            .collect::<Vec<_>>();
        if reverse {
            parts.reverse();
        }
        if let Some(keep) = keep {
            if 0 == keep {
                return Err(());
            }
            if parts.len() > keep {
                parts.drain(..parts.len() - keep);
            }
        }

        Ok(parts.join("."))
    }
}

fn parse_name(s: &str) -> Result<dns::Name, SpfResult> {
    dns::Name::from_utf8(s).map_err(|_| SpfResult::PermError)
}

fn v4_match(ip: Ipv4Addr, net: Ipv4Addr, len: u8) -> bool {
    if len >= 32 {
        return ip == net;
    }
    let mask = if 0 == len { 0 } else { u32::MAX << (32 - len) };
    (u32::from(ip) & mask) == (u32::from(net) & mask)
}

fn v6_match(ip: Ipv6Addr, net: Ipv6Addr, len: u8) -> bool {
    if len >= 128 {
        return ip == net;
    }
    let mask = if 0 == len {
        0
    } else {
        u128::MAX << (128 - len)
    };
    (u128::from(ip) & mask) == (u128::from(net) & mask)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn result(self) -> SpfResult {
        match self {
            Self::Pass => SpfResult::Pass,
            Self::Fail => SpfResult::Fail,
            Self::SoftFail => SpfResult::SoftFail,
            Self::Neutral => SpfResult::Neutral,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Mechanism {
    All,
    Include(String),
    A {
        domain: Option<String>,
        v4: u8,
        v6: u8,
    },
    Mx {
        domain: Option<String>,
        v4: u8,
        v6: u8,
    },
    Ptr(Option<String>),
    Ip4(Ipv4Addr, u8),
    Ip6(Ipv6Addr, u8),
    Exists(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Term {
    Directive(Qualifier, Mechanism),
    Redirect(String),
    Exp(String),
    Unknown,
}

impl Term {
    /// Parses a single term: one non-empty word from the record.
    fn parse(word: &str) -> Result<Self, ()> {
        if let Some((name, value)) = split_modifier(word) {
            return Ok(if name.eq_ignore_ascii_case("redirect") {
                Self::Redirect(value.to_owned())
            } else if name.eq_ignore_ascii_case("exp") {
                Self::Exp(value.to_owned())
            } else {
                Self::Unknown
            });
        }

        let mut rest = word;
        let qualifier = match rest.chars().next() {
            Some('+') => {
                rest = &rest[1..];
                Qualifier::Pass
            },
            Some('-') => {
                rest = &rest[1..];
                Qualifier::Fail
            },
            Some('~') => {
                rest = &rest[1..];
                Qualifier::SoftFail
            },
            Some('?') => {
                rest = &rest[1..];
                Qualifier::Neutral
            },
            Some(_) => Qualifier::Pass,
            None => return Err(()),
        };

        let name_end = rest
            .char_indices()
            .find(|&(_, c)| ':' == c || '/' == c)
            .map(|(ix, _)| ix)
            .unwrap_or(rest.len());
        let (name, arg) = rest.split_at(name_end);

        let mechanism = if name.eq_ignore_ascii_case("all") {
            if !arg.is_empty() {
                return Err(());
            }
            Mechanism::All
        } else if name.eq_ignore_ascii_case("include") {
            Mechanism::Include(required_arg(arg)?)
        } else if name.eq_ignore_ascii_case("exists") {
            Mechanism::Exists(required_arg(arg)?)
        } else if name.eq_ignore_ascii_case("ptr") {
            Mechanism::Ptr(optional_arg(arg)?)
        } else if name.eq_ignore_ascii_case("a") {
            let (domain, v4, v6) = dual_cidr(arg)?;
            Mechanism::A { domain, v4, v6 }
        } else if name.eq_ignore_ascii_case("mx") {
            let (domain, v4, v6) = dual_cidr(arg)?;
            Mechanism::Mx { domain, v4, v6 }
        } else if name.eq_ignore_ascii_case("ip4") {
            let spec = required_arg(arg)?;
            let (addr, len) = match spec.split_once('/') {
                Some((addr, len)) => {
                    (addr, len.parse::<u8>().map_err(|_| ())?)
                },
                None => (spec.as_str(), 32),
            };
            if len > 32 {
                return Err(());
            }
            Mechanism::Ip4(addr.parse().map_err(|_| ())?, len)
        } else if name.eq_ignore_ascii_case("ip6") {
            let spec = required_arg(arg)?;
            let (addr, len) = match spec.split_once('/') {
                Some((addr, len)) => {
                    (addr, len.parse::<u8>().map_err(|_| ())?)
                },
                None => (spec.as_str(), 128),
            };
            if len > 128 {
                return Err(());
            }
            Mechanism::Ip6(addr.parse().map_err(|_| ())?, len)
        } else {
            return Err(());
        };

        Ok(Self::Directive(qualifier, mechanism))
    }
}

/// `name=value` with a modifier-shaped name, per RFC 7208 § 12.
fn split_modifier(word: &str) -> Option<(&str, &str)> {
    let eq = word.find('=')?;
    let name = &word[..eq];
    let mut chars = name.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
        return None;
    }
    Some((name, &word[eq + 1..]))
}

fn required_arg(arg: &str) -> Result<String, ()> {
    match arg.strip_prefix(':') {
        Some(value) if !value.is_empty() => Ok(value.to_owned()),
        _ => Err(()),
    }
}

fn optional_arg(arg: &str) -> Result<Option<String>, ()> {
    if arg.is_empty() {
        return Ok(None);
    }
    required_arg(arg).map(Some)
}

/// `[":" domain-spec] ["/" ip4-cidr] ["//" ip6-cidr]` for `a` and `mx`.
fn dual_cidr(arg: &str) -> Result<(Option<String>, u8, u8), ()> {
    let (domain, cidr) = if let Some(rest) = arg.strip_prefix(':') {
        match rest.find('/') {
            Some(ix) => (Some(rest[..ix].to_owned()), &rest[ix..]),
            None => (Some(rest.to_owned()), ""),
        }
    } else {
        (None, arg)
    };

    if let Some(ref domain) = domain {
        if domain.is_empty() {
            return Err(());
        }
    }

    let (mut v4, mut v6) = (32u8, 128u8);
    if !cidr.is_empty() {
        let cidr = cidr.strip_prefix('/').ok_or(())?;
        let (v4_part, v6_part) = if let Some(v6) = cidr.strip_prefix('/') {
            // "a//64": only an ip6 length.
            ("", Some(v6))
        } else {
            match cidr.split_once("//") {
                Some((v4_part, v6_part)) => (v4_part, Some(v6_part)),
                None => (cidr, None),
            }
        };

        if !v4_part.is_empty() {
            v4 = v4_part.parse().map_err(|_| ())?;
            if v4 > 32 {
                return Err(());
            }
        }
        if let Some(v6_part) = v6_part {
            v6 = v6_part.parse().map_err(|_| ())?;
            if v6 > 128 {
                return Err(());
            }
        }
    }

    Ok((domain, v4, v6))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::support::dns::{Cache, Entry};

    fn name(s: &str) -> dns::Name {
        dns::Name::from_ascii(s).unwrap()
    }

    fn ctx(ip: &str) -> Context<'static> {
        Context {
            sender: Some(Cow::Borrowed("strong-bad@email.example.com")),
            sender_local: Some(Cow::Borrowed("strong-bad")),
            sender_domain: Cow::Borrowed("email.example.com"),
            helo_domain: Cow::Borrowed("mail.example.com"),
            ip: ip.parse().unwrap(),
            receiver_host: Cow::Borrowed("mx.receiver.example"),
        }
    }

    fn eval(
        cache: Cache,
        ctx: &Context<'_>,
    ) -> SpfOutcome {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        rt.block_on(local.run_until(async {
            let cache = Rc::new(RefCell::new(cache));
            run(
                ctx,
                &cache,
                None,
                tokio::time::Instant::now()
                    + std::time::Duration::from_secs(5),
            )
            .await
        }))
    }

    fn txt(cache: &mut Cache, domain: &str, record: &str) {
        cache.txt.push((
            Rc::new(name(domain)),
            Entry::Ok(vec![record.to_owned().into()]),
        ));
    }

    #[test]
    fn ip4_pass_and_fail() {
        let mut cache = Cache::default();
        txt(
            &mut cache,
            "email.example.com",
            "v=spf1 ip4:192.0.2.0/24 -all",
        );
        let outcome = eval(cache, &ctx("192.0.2.99"));
        assert_eq!(SpfResult::Pass, outcome.result);
        assert_eq!("email.example.com", outcome.domain);

        let mut cache = Cache::default();
        txt(
            &mut cache,
            "email.example.com",
            "v=spf1 ip4:192.0.2.0/24 -all",
        );
        let outcome = eval(cache, &ctx("198.51.100.1"));
        assert_eq!(SpfResult::Fail, outcome.result);
    }

    #[test]
    fn a_mechanism() {
        let mut cache = Cache::default();
        txt(&mut cache, "email.example.com", "v=spf1 a -all");
        cache.a.push((
            Rc::new(name("email.example.com")),
            Entry::Ok(vec!["192.0.2.3".parse().unwrap()]),
        ));
        assert_eq!(SpfResult::Pass, eval(cache, &ctx("192.0.2.3")).result);
    }

    #[test]
    fn mx_mechanism() {
        let mut cache = Cache::default();
        txt(&mut cache, "email.example.com", "v=spf1 mx -all");
        cache.mx.push((
            Rc::new(name("email.example.com")),
            Entry::Ok(vec![Rc::new(name("mx1.example.com"))]),
        ));
        cache.a.push((
            Rc::new(name("mx1.example.com")),
            Entry::Ok(vec!["192.0.2.7".parse().unwrap()]),
        ));
        assert_eq!(SpfResult::Pass, eval(cache, &ctx("192.0.2.7")).result);
    }

    #[test]
    fn include_and_softfail() {
        let mut cache = Cache::default();
        txt(
            &mut cache,
            "email.example.com",
            "v=spf1 include:_spf.example.net ~all",
        );
        txt(
            &mut cache,
            "_spf.example.net",
            "v=spf1 ip4:203.0.113.0/24 -all",
        );

        let outcome = eval(cache, &ctx("203.0.113.5"));
        assert_eq!(SpfResult::Pass, outcome.result);

        let mut cache = Cache::default();
        txt(
            &mut cache,
            "email.example.com",
            "v=spf1 include:_spf.example.net ~all",
        );
        txt(
            &mut cache,
            "_spf.example.net",
            "v=spf1 ip4:203.0.113.0/24 -all",
        );
        let outcome = eval(cache, &ctx("192.0.2.1"));
        assert_eq!(SpfResult::SoftFail, outcome.result);
    }

    #[test]
    fn redirect() {
        let mut cache = Cache::default();
        txt(
            &mut cache,
            "email.example.com",
            "v=spf1 redirect=_spf.example.net",
        );
        txt(
            &mut cache,
            "_spf.example.net",
            "v=spf1 ip4:203.0.113.0/24 -all",
        );
        assert_eq!(
            SpfResult::Fail,
            eval(cache, &ctx("192.0.2.1")).result,
        );
    }

    #[test]
    fn no_record_is_none() {
        let mut cache = Cache::default();
        cache
            .txt
            .push((Rc::new(name("email.example.com")), Entry::NotFound));
        assert_eq!(SpfResult::None, eval(cache, &ctx("192.0.2.1")).result);
    }

    #[test]
    fn dns_failure_is_temperror() {
        let cache = Cache::default();
        // Nothing preloaded and no resolver: the lookup errors out.
        assert_eq!(
            SpfResult::TempError,
            eval(cache, &ctx("192.0.2.1")).result,
        );
    }

    #[test]
    fn multiple_records_is_permerror() {
        let mut cache = Cache::default();
        cache.txt.push((
            Rc::new(name("email.example.com")),
            Entry::Ok(vec![
                "v=spf1 -all".to_owned().into(),
                "v=spf1 +all".to_owned().into(),
            ]),
        ));
        assert_eq!(
            SpfResult::PermError,
            eval(cache, &ctx("192.0.2.1")).result,
        );
    }

    #[test]
    fn exists_with_macros() {
        let mut cache = Cache::default();
        txt(
            &mut cache,
            "email.example.com",
            "v=spf1 exists:%{ir}.%{v}.%{d2}.sbl.example -all",
        );
        // 99.2.0.192.in-addr.example.com.sbl.example
        cache.a.push((
            Rc::new(name("99.2.0.192.in-addr.example.com.sbl.example")),
            Entry::Ok(vec!["127.0.0.2".parse().unwrap()]),
        ));
        assert_eq!(
            SpfResult::Pass,
            eval(cache, &ctx("192.0.2.99")).result,
        );
    }

    #[test]
    fn lookup_limit() {
        let mut cache = Cache::default();
        // A record that includes itself forever burns through the limit.
        txt(
            &mut cache,
            "email.example.com",
            "v=spf1 include:email.example.com -all",
        );
        assert_eq!(
            SpfResult::PermError,
            eval(cache, &ctx("192.0.2.1")).result,
        );
    }

    #[test]
    fn neutral_default() {
        let mut cache = Cache::default();
        txt(&mut cache, "email.example.com", "v=spf1 ip4:10.0.0.0/8");
        assert_eq!(
            SpfResult::Neutral,
            eval(cache, &ctx("192.0.2.1")).result,
        );
    }

    #[test]
    fn received_spf_header() {
        let mut cache = Cache::default();
        txt(
            &mut cache,
            "email.example.com",
            "v=spf1 ip4:192.0.2.0/24 -all",
        );
        let context = ctx("192.0.2.99");
        let outcome = eval(cache, &context);
        let header = outcome.received_spf(&context);
        assert!(header.starts_with("Received-SPF: pass ("));
        assert!(header.contains("client-ip=192.0.2.99;"));
        assert!(header
            .contains("envelope-from=strong-bad@email.example.com;"));
        assert!(header.contains("helo=mail.example.com;"));
    }

    #[test]
    fn term_parsing() {
        assert_eq!(
            Term::Directive(Qualifier::Fail, Mechanism::All),
            Term::parse("-all").unwrap(),
        );
        assert_eq!(
            Term::Directive(
                Qualifier::Pass,
                Mechanism::A {
                    domain: Some("example.com".to_owned()),
                    v4: 24,
                    v6: 64,
                },
            ),
            Term::parse("a:example.com/24//64").unwrap(),
        );
        assert_eq!(
            Term::Directive(
                Qualifier::Pass,
                Mechanism::A {
                    domain: None,
                    v4: 24,
                    v6: 128,
                },
            ),
            Term::parse("a/24").unwrap(),
        );
        assert_eq!(
            Term::Redirect("_spf.example.com".to_owned()),
            Term::parse("redirect=_spf.example.com").unwrap(),
        );
        assert_eq!(Term::Unknown, Term::parse("moo=cow").unwrap());
        assert!(Term::parse("ip4:not-an-ip").is_err());
        assert!(Term::parse("ip4:192.0.2.0/33").is_err());
        assert!(Term::parse("bogus").is_err());
    }
}
