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

//! The RFC 5321 command grammar.
//!
//! This is the only place in the program that parses SMTP command lines.
//! Input arrives one line at a time with the CRLF already removed (and
//! already verified to have been a proper CRLF). Every recognised verb
//! produces a `Command`; anything else produces a `ParseError` carrying the
//! byte offset and a diagnostic, which the session turns into the
//! appropriate 5xx reply.
//!
//! Mailbox and domain productions accept internationalised labels (raw
//! UTF-8 in `atext` and `u-label` positions, RFC 6531). The obsolete but
//! common space after `FROM:`/`TO:` is accepted, as are RFC 5321 source
//! routes (accepted and ignored, as the RFC instructs).

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use crate::support::dns;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Helo(Domain),
    Ehlo(Domain),
    /// `MAIL FROM:<reverse-path> [params]`; `None` is the bounce sender
    /// `<>`.
    MailFrom(Option<Mailbox>, Vec<Param>),
    /// `RCPT TO:<forward-path> [params]`. The magic `<Postmaster>` form
    /// parses as a mailbox with an empty domain.
    RcptTo(Mailbox, Vec<Param>),
    Data,
    Bdat {
        size: u64,
        last: bool,
    },
    Rset,
    Noop(Option<String>),
    Vrfy(Option<String>),
    Help(Option<String>),
    StartTls,
    Quit,
    /// Whatever followed `AUTH`; always rejected by the session.
    Auth(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub value: Option<String>,
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.value {
            Some(ref value) => write!(f, "{}={}", self.name, value),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A domain or address literal, carrying both the form the client sent and
/// the comparable lowercased ASCII (A-label) form.
#[derive(Clone, Debug, Eq)]
pub struct Domain {
    utf8: String,
    ascii: String,
    literal: Option<Option<IpAddr>>,
}

impl Domain {
    /// The empty domain, used by the bounce sender and magic Postmaster.
    pub fn empty() -> Self {
        Self {
            utf8: String::new(),
            ascii: String::new(),
            literal: None,
        }
    }

    /// Builds a `Domain` from a structurally valid name, converting
    /// internationalised labels to their A-label form.
    pub fn from_name(s: &str) -> Result<Self, ()> {
        let ascii = if s.is_ascii() {
            s.to_lowercase()
        } else {
            dns::Name::from_utf8(s)
                .map_err(|_| ())?
                .to_ascii()
                .trim_end_matches('.')
                .to_lowercase()
        };

        Ok(Self {
            utf8: s.to_owned(),
            ascii,
            literal: None,
        })
    }

    fn from_literal(bracketed: &str, addr: Option<IpAddr>) -> Self {
        Self {
            utf8: bracketed.to_owned(),
            ascii: bracketed.to_lowercase(),
            literal: Some(addr),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ascii.is_empty()
    }

    pub fn is_address_literal(&self) -> bool {
        self.literal.is_some()
    }

    /// The IP inside an `[IPv4]` / `[IPv6:…]` literal. `None` for names and
    /// tagged general literals.
    pub fn literal_addr(&self) -> Option<IpAddr> {
        self.literal.flatten()
    }

    pub fn is_unicode(&self) -> bool {
        !self.utf8.is_ascii()
    }

    /// The comparable lowercased ASCII form.
    pub fn ascii(&self) -> &str {
        &self.ascii
    }

    /// The form the client sent.
    pub fn utf8(&self) -> &str {
        &self.utf8
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.ascii.split('.')
    }

    pub fn eq_str(&self, s: &str) -> bool {
        self.ascii.eq_ignore_ascii_case(s)
    }
}

impl PartialEq for Domain {
    fn eq(&self, other: &Self) -> bool {
        self.ascii == other.ascii
    }
}

impl std::hash::Hash for Domain {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ascii.hash(state);
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.utf8)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mailbox {
    pub local: String,
    pub domain: Domain,
}

impl Mailbox {
    /// The magic `<Postmaster>` recipient (RFC 5321 § 4.5.1).
    pub fn postmaster() -> Self {
        Self {
            local: "Postmaster".to_owned(),
            domain: Domain::empty(),
        }
    }

    pub fn is_magic_postmaster(&self) -> bool {
        self.domain.is_empty()
            && self.local.eq_ignore_ascii_case("postmaster")
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{}@{}", self.local, self.domain)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("unrecognised command")]
    UnknownCommand,
    #[error("invalid domain")]
    BadDomain,
    #[error("invalid address literal")]
    BadAddressLiteral,
    #[error("invalid mailbox")]
    BadMailbox,
    #[error("invalid ESMTP parameter")]
    BadParameter,
    #[error("invalid chunk size")]
    BadChunkSize,
    #[error("trailing garbage after command")]
    TrailingGarbage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseError {
    /// Byte offset into the command line where parsing failed.
    pub offset: usize,
    pub kind: ParseErrorKind,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} at offset {}", self.kind, self.offset)
    }
}

impl Command {
    /// Parses one command line (CRLF already stripped).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut cur = Cursor { line, pos: 0 };

        if cur.eat_ci("HELO ") {
            let domain = domain(&mut cur)?;
            cur.expect_end()?;
            return Ok(Command::Helo(domain));
        }

        if cur.eat_ci("EHLO ") {
            let domain = domain_or_literal(&mut cur)?;
            cur.expect_end()?;
            return Ok(Command::Ehlo(domain));
        }

        if cur.eat_ci("MAIL FROM:") {
            // Obsolete in RFC 5321, but kosher in RFC 821.
            cur.eat(' ');
            let path = reverse_path(&mut cur)?;
            let params = esmtp_params(&mut cur)?;
            return Ok(Command::MailFrom(path, params));
        }

        if cur.eat_ci("RCPT TO:") {
            cur.eat(' ');
            let path = forward_path(&mut cur)?;
            let params = esmtp_params(&mut cur)?;
            return Ok(Command::RcptTo(path, params));
        }

        if cur.eat_ci("BDAT ") {
            let digits = cur.take_while(|c| c.is_ascii_digit());
            if digits.is_empty() {
                return Err(cur.err(ParseErrorKind::BadChunkSize));
            }
            let size = digits
                .parse::<u64>()
                .map_err(|_| cur.err(ParseErrorKind::BadChunkSize))?;
            let last = cur.eat_ci(" LAST");
            cur.expect_end()?;
            return Ok(Command::Bdat { size, last });
        }

        if cur.eat_ci("AUTH") {
            if cur.at_end() {
                return Ok(Command::Auth(String::new()));
            }
            if cur.eat(' ') {
                return Ok(Command::Auth(cur.rest().to_owned()));
            }
            return Err(cur.err(ParseErrorKind::UnknownCommand));
        }

        for &(verb, ref cmd) in &[
            ("DATA", Command::Data),
            ("RSET", Command::Rset),
            ("QUIT", Command::Quit),
            ("STARTTLS", Command::StartTls),
        ] {
            let mut attempt = Cursor { line, pos: 0 };
            if attempt.eat_ci(verb) && attempt.at_end() {
                return Ok(cmd.clone());
            }
        }

        for &(verb, ctor) in &[
            ("NOOP", Command::Noop as fn(Option<String>) -> Command),
            ("VRFY", Command::Vrfy),
            ("HELP", Command::Help),
        ] {
            let mut attempt = Cursor { line, pos: 0 };
            if attempt.eat_ci(verb) {
                if attempt.at_end() {
                    return Ok(ctor(None));
                }
                if attempt.eat(' ') && !attempt.at_end() {
                    return Ok(ctor(Some(attempt.rest().to_owned())));
                }
            }
        }

        Err(ParseError {
            offset: 0,
            kind: ParseErrorKind::UnknownCommand,
        })
    }
}

impl std::str::FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        Self::parse(s)
    }
}

struct Cursor<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.line[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.line.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// The character after the next one, for one-token lookahead.
    fn peek2(&self) -> Option<char> {
        let mut chars = self.rest().chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if Some(c) == self.peek() {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    /// Consumes an ASCII case-insensitive literal.
    fn eat_ci(&mut self, tag: &str) -> bool {
        let rest = self.rest();
        if rest.len() >= tag.len()
            && rest[..tag.len()].eq_ignore_ascii_case(tag)
        {
            self.pos += tag.len();
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, mut pred: impl FnMut(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
        &self.line[start..self.pos]
    }

    fn expect(
        &mut self,
        c: char,
        kind: ParseErrorKind,
    ) -> Result<(), ParseError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.err(kind))
        }
    }

    fn expect_end(&self) -> Result<(), ParseError> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.err(ParseErrorKind::TrailingGarbage))
        }
    }

    fn err(&self, kind: ParseErrorKind) -> ParseError {
        ParseError {
            offset: self.pos,
            kind,
        }
    }
}

fn is_let_dig(c: char) -> bool {
    c.is_ascii_alphanumeric() || !c.is_ascii()
}

/// `atext` from RFC 5321 with the RFC 6531 UTF-8 extension.
fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
        || !c.is_ascii()
}

fn sub_domain(cur: &mut Cursor) -> Result<(), ParseError> {
    let start = cur.pos;
    match cur.peek() {
        Some(c) if is_let_dig(c) => {
            cur.bump();
        },
        _ => return Err(cur.err(ParseErrorKind::BadDomain)),
    }

    let mut last = ' ';
    let _ = cur.take_while(|c| {
        if is_let_dig(c) || '-' == c {
            last = c;
            true
        } else {
            false
        }
    });

    if '-' == last {
        return Err(ParseError {
            offset: start,
            kind: ParseErrorKind::BadDomain,
        });
    }

    Ok(())
}

fn domain(cur: &mut Cursor) -> Result<Domain, ParseError> {
    let start = cur.pos;
    loop {
        sub_domain(cur)?;
        // Only cross the dot if another label follows; a trailing dot
        // belongs to whatever comes next.
        if Some('.') == cur.peek()
            && cur.peek2().is_some_and(is_let_dig)
        {
            cur.bump();
        } else {
            break;
        }
    }

    let span = &cur.line[start..cur.pos];
    Domain::from_name(span).map_err(|()| ParseError {
        offset: start,
        kind: ParseErrorKind::BadDomain,
    })
}

/// `[IPv4]`, `[IPv6:…]`, or `[tag:content]` (RFC 5321 § 4.1.3).
fn address_literal(cur: &mut Cursor) -> Result<Domain, ParseError> {
    let start = cur.pos;
    cur.expect('[', ParseErrorKind::BadAddressLiteral)?;
    let inner = cur.take_while(|c| {
        matches!(c, '!'..='Z' | '^'..='~')
    });
    if inner.is_empty() {
        return Err(cur.err(ParseErrorKind::BadAddressLiteral));
    }
    let inner = inner.to_owned();
    cur.expect(']', ParseErrorKind::BadAddressLiteral)?;
    let bracketed = &cur.line[start..cur.pos];

    if let Ok(v4) = inner.parse::<std::net::Ipv4Addr>() {
        return Ok(Domain::from_literal(bracketed, Some(IpAddr::V4(v4))));
    }

    if let Some(v6_text) = ci_prefix(&inner, "IPv6:") {
        let v6 = v6_text
            .parse::<std::net::Ipv6Addr>()
            .map_err(|_| ParseError {
                offset: start,
                kind: ParseErrorKind::BadAddressLiteral,
            })?;
        return Ok(Domain::from_literal(bracketed, Some(IpAddr::V6(v6))));
    }

    // General-address-literal: Ldh-str ":" 1*dcontent
    let Some((tag, content)) = inner.split_once(':') else {
        return Err(ParseError {
            offset: start,
            kind: ParseErrorKind::BadAddressLiteral,
        });
    };
    let tag_ok = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || '-' == c)
        && !tag.ends_with('-');
    if !tag_ok || content.is_empty() {
        return Err(ParseError {
            offset: start,
            kind: ParseErrorKind::BadAddressLiteral,
        });
    }

    Ok(Domain::from_literal(bracketed, None))
}

fn ci_prefix<'a>(s: &'a str, tag: &str) -> Option<&'a str> {
    if s.len() >= tag.len() && s[..tag.len()].eq_ignore_ascii_case(tag) {
        Some(&s[tag.len()..])
    } else {
        None
    }
}

fn domain_or_literal(cur: &mut Cursor) -> Result<Domain, ParseError> {
    if Some('[') == cur.peek() {
        address_literal(cur)
    } else {
        domain(cur)
    }
}

fn dot_string(cur: &mut Cursor) -> Result<(), ParseError> {
    loop {
        if cur.take_while(is_atext).is_empty() {
            return Err(cur.err(ParseErrorKind::BadMailbox));
        }
        if Some('.') == cur.peek() && cur.peek2().is_some_and(is_atext) {
            cur.bump();
        } else {
            break;
        }
    }
    Ok(())
}

fn quoted_string(cur: &mut Cursor) -> Result<(), ParseError> {
    cur.expect('"', ParseErrorKind::BadMailbox)?;
    loop {
        match cur.peek() {
            Some('"') => {
                cur.bump();
                return Ok(());
            },
            Some('\\') => {
                cur.bump();
                match cur.peek() {
                    Some(' '..='~') => {
                        cur.bump();
                    },
                    _ => return Err(cur.err(ParseErrorKind::BadMailbox)),
                }
            },
            // qtextSMTP plus the RFC 6531 UTF-8 extension
            Some(c)
                if matches!(c, ' ' | '!' | '#'..='[' | ']'..='~')
                    || !c.is_ascii() =>
            {
                cur.bump();
            },
            _ => return Err(cur.err(ParseErrorKind::BadMailbox)),
        }
    }
}

fn mailbox(cur: &mut Cursor) -> Result<Mailbox, ParseError> {
    let start = cur.pos;
    if Some('"') == cur.peek() {
        quoted_string(cur)?;
    } else {
        dot_string(cur)?;
    }
    let local = cur.line[start..cur.pos].to_owned();

    cur.expect('@', ParseErrorKind::BadMailbox)?;
    let domain = domain_or_literal(cur)?;

    Ok(Mailbox { local, domain })
}

/// `"<" [A-d-l ":"] Mailbox ">"`. The source route is accepted and
/// discarded, as RFC 5321 instructs.
fn path(cur: &mut Cursor) -> Result<Mailbox, ParseError> {
    cur.expect('<', ParseErrorKind::BadMailbox)?;

    if Some('@') == cur.peek() {
        loop {
            cur.expect('@', ParseErrorKind::BadMailbox)?;
            domain(cur)?;
            if !cur.eat(',') {
                break;
            }
        }
        cur.expect(':', ParseErrorKind::BadMailbox)?;
    }

    let mailbox = mailbox(cur)?;
    cur.expect('>', ParseErrorKind::BadMailbox)?;
    Ok(mailbox)
}

fn reverse_path(
    cur: &mut Cursor,
) -> Result<Option<Mailbox>, ParseError> {
    if cur.eat_ci("<>") {
        return Ok(None);
    }
    path(cur).map(Some)
}

fn forward_path(cur: &mut Cursor) -> Result<Mailbox, ParseError> {
    if cur.eat_ci("<Postmaster>") {
        return Ok(Mailbox::postmaster());
    }
    path(cur)
}

fn is_esmtp_value_char(c: char) -> bool {
    matches!(c, '!'..='<' | '>'..='~') || !c.is_ascii()
}

fn esmtp_params(cur: &mut Cursor) -> Result<Vec<Param>, ParseError> {
    let mut params = Vec::new();

    while !cur.at_end() {
        if !cur.eat(' ') {
            return Err(cur.err(ParseErrorKind::TrailingGarbage));
        }
        if cur.at_end() {
            // Tolerate a trailing space.
            break;
        }

        let name_start = cur.pos;
        match cur.peek() {
            Some(c) if c.is_ascii_alphanumeric() => {
                cur.bump();
            },
            _ => return Err(cur.err(ParseErrorKind::BadParameter)),
        }
        let _ =
            cur.take_while(|c| c.is_ascii_alphanumeric() || '-' == c);
        let name = cur.line[name_start..cur.pos].to_owned();

        let value = if cur.eat('=') {
            let value = cur.take_while(is_esmtp_value_char);
            if value.is_empty() {
                return Err(cur.err(ParseErrorKind::BadParameter));
            }
            Some(value.to_owned())
        } else {
            None
        };

        params.push(Param { name, value });
    }

    Ok(params)
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(s: &str) -> Command {
        Command::parse(s).unwrap()
    }

    fn mb(local: &str, domain: &str) -> Mailbox {
        Mailbox {
            local: local.to_owned(),
            domain: Domain::from_name(domain).unwrap(),
        }
    }

    #[test]
    fn single_verbs() {
        assert_eq!(Command::Data, parse("DATA"));
        assert_eq!(Command::Data, parse("data"));
        assert_eq!(Command::Rset, parse("rset"));
        assert_eq!(Command::Quit, parse("Quit"));
        assert_eq!(Command::StartTls, parse("STARTTLS"));
        assert_eq!(Command::StartTls, parse("starttls"));

        assert_eq!(
            ParseErrorKind::UnknownCommand,
            Command::parse("DATA DATA").unwrap_err().kind,
        );
        assert_eq!(
            ParseErrorKind::UnknownCommand,
            Command::parse("DATABASE").unwrap_err().kind,
        );
        assert_eq!(
            ParseErrorKind::UnknownCommand,
            Command::parse("STARTTLS 1.3").unwrap_err().kind,
        );
        assert_eq!(
            ParseErrorKind::UnknownCommand,
            Command::parse("").unwrap_err().kind,
        );
        assert_eq!(
            ParseErrorKind::UnknownCommand,
            Command::parse("GET / HTTP/1.0").unwrap_err().kind,
        );
    }

    #[test]
    fn noop_vrfy_help() {
        assert_eq!(Command::Noop(None), parse("NOOP"));
        assert_eq!(
            Command::Noop(Some("param".to_owned())),
            parse("noop param"),
        );
        assert_eq!(Command::Vrfy(None), parse("VRFY"));
        assert_eq!(
            Command::Vrfy(Some("<foo@bar.com>".to_owned())),
            parse("vrfy <foo@bar.com>"),
        );
        assert_eq!(Command::Help(None), parse("HELP"));
        assert_eq!(Command::Help(Some("me".to_owned())), parse("help me"));
    }

    #[test]
    fn helo_ehlo() {
        assert_eq!(
            Command::Helo(Domain::from_name("foo.example.com").unwrap()),
            parse("HELO foo.example.com"),
        );
        assert_eq!(
            Command::Ehlo(Domain::from_name("foo.example.com").unwrap()),
            parse("ehlo foo.example.com"),
        );

        let Command::Ehlo(domain) = parse("EHLO [192.0.2.3]") else {
            panic!("not EHLO");
        };
        assert!(domain.is_address_literal());
        assert_eq!(
            Some("192.0.2.3".parse::<IpAddr>().unwrap()),
            domain.literal_addr(),
        );

        // HELO formally only takes a domain, but the session wants to see
        // the identity to judge it, so the grammar is strict here.
        assert_eq!(
            ParseErrorKind::BadDomain,
            Command::parse("HELO [192.0.2.3]").unwrap_err().kind,
        );
        assert_eq!(
            ParseErrorKind::BadDomain,
            Command::parse("HELO foo-.example.com").unwrap_err().kind,
        );
        assert_eq!(
            ParseErrorKind::TrailingGarbage,
            Command::parse("EHLO foo.example.com client").unwrap_err().kind,
        );
    }

    #[test]
    fn mail_from() {
        assert_eq!(
            Command::MailFrom(Some(mb("user", "host.example")), vec![]),
            parse("MAIL FROM:<user@host.example>"),
        );
        assert_eq!(
            Command::MailFrom(None, vec![]),
            parse("mail from:<>"),
        );
        // Obsolete space after the colon.
        assert_eq!(
            Command::MailFrom(Some(mb("user", "host.example")), vec![]),
            parse("MAIL FROM: <user@host.example>"),
        );
        // Source route accepted and ignored.
        assert_eq!(
            Command::MailFrom(Some(mb("userc", "d.bar.org")), vec![]),
            parse("MAIL FROM:<@hosta.int,@jkl.org:userc@d.bar.org>"),
        );

        assert_eq!(
            Command::MailFrom(
                Some(mb("user", "host.example")),
                vec![
                    Param {
                        name: "SMTPUTF8".to_owned(),
                        value: None,
                    },
                    Param {
                        name: "BODY".to_owned(),
                        value: Some("8BITMIME".to_owned()),
                    },
                ],
            ),
            parse("MAIL FROM:<user@host.example> SMTPUTF8 BODY=8BITMIME"),
        );

        assert_eq!(
            ParseErrorKind::BadMailbox,
            Command::parse("MAIL FROM:user@host.example")
                .unwrap_err()
                .kind,
        );
        assert_eq!(
            ParseErrorKind::BadParameter,
            Command::parse("MAIL FROM:<u@h.example> BODY=")
                .unwrap_err()
                .kind,
        );
    }

    #[test]
    fn mail_from_literals() {
        let Command::MailFrom(Some(mailbox), _) =
            parse("mail from:<user@[IPv6:::1]>")
        else {
            panic!("not MAIL");
        };
        assert!(mailbox.domain.is_address_literal());
        assert_eq!(
            Some("::1".parse::<IpAddr>().unwrap()),
            mailbox.domain.literal_addr(),
        );
        assert_eq!("[IPv6:::1]", mailbox.domain.utf8());

        let Command::MailFrom(Some(mailbox), _) =
            parse("mail from:<user@[future:something]>")
        else {
            panic!("not MAIL");
        };
        assert!(mailbox.domain.is_address_literal());
        assert_eq!(None, mailbox.domain.literal_addr());

        assert_eq!(
            ParseErrorKind::BadAddressLiteral,
            Command::parse("MAIL FROM:<u@[not-an-ip]>").unwrap_err().kind,
        );
    }

    #[test]
    fn rcpt_to() {
        assert_eq!(
            Command::RcptTo(mb("user", "host.example"), vec![]),
            parse("Rcpt To:<user@host.example>"),
        );
        assert_eq!(
            Command::RcptTo(mb("userc", "d.bar.org"), vec![]),
            parse("rcpt to:<@hosta.int,@jkl.org:userc@d.bar.org>"),
        );
        assert_eq!(
            Command::RcptTo(Mailbox::postmaster(), vec![]),
            parse("RCPT TO:<PostMastER>"),
        );
        assert!(Mailbox::postmaster().is_magic_postmaster());

        let Command::RcptTo(mailbox, _) =
            parse("RCPT TO:<\"asking for trouble\"@host.example>")
        else {
            panic!("not RCPT");
        };
        assert_eq!("\"asking for trouble\"", mailbox.local);

        assert_eq!(
            ParseErrorKind::BadMailbox,
            Command::parse("RCPT TO:<>").unwrap_err().kind,
        );
    }

    #[test]
    fn utf8_addresses() {
        let Command::MailFrom(Some(mailbox), _) =
            parse("MAIL FROM:<Dörte@Sörensen.example>")
        else {
            panic!("not MAIL");
        };
        assert_eq!("Dörte", mailbox.local);
        assert_eq!("Sörensen.example", mailbox.domain.utf8());
        assert!(mailbox.domain.is_unicode());
        assert!(mailbox.domain.ascii().starts_with("xn--"));

        // Equality is on the A-label form, case-insensitively.
        assert_eq!(
            mailbox.domain,
            Domain::from_name("SÖRENSEN.example").unwrap(),
        );
    }

    #[test]
    fn bdat() {
        assert_eq!(
            Command::Bdat {
                size: 42,
                last: false,
            },
            parse("BDAT 42"),
        );
        assert_eq!(
            Command::Bdat {
                size: 1000,
                last: true,
            },
            parse("BDAT 1000 LAST"),
        );
        assert_eq!(
            Command::Bdat {
                size: 1,
                last: true,
            },
            parse("bdat 1 last"),
        );

        // A bare BDAT with no size never matches the verb at all.
        assert_eq!(
            ParseErrorKind::UnknownCommand,
            Command::parse("BDAT").unwrap_err().kind,
        );
        assert_eq!(
            ParseErrorKind::BadChunkSize,
            Command::parse("BDAT many").unwrap_err().kind,
        );
        assert_eq!(
            ParseErrorKind::BadChunkSize,
            Command::parse("BDAT 99999999999999999999")
                .unwrap_err()
                .kind,
        );
    }

    #[test]
    fn auth() {
        assert_eq!(
            Command::Auth("PLAIN dGVzdA==".to_owned()),
            parse("AUTH PLAIN dGVzdA=="),
        );
        assert_eq!(Command::Auth(String::new()), parse("AUTH"));
    }

    #[test]
    fn error_offsets() {
        let e = Command::parse("MAIL FROM:<user@>").unwrap_err();
        assert_eq!(ParseErrorKind::BadDomain, e.kind);
        assert_eq!(16, e.offset);
    }

    #[test]
    fn domain_forms() {
        let d = Domain::from_name("Example.COM").unwrap();
        assert_eq!("example.com", d.ascii());
        assert_eq!("Example.COM", d.utf8());
        assert!(!d.is_unicode());
        assert!(!d.is_address_literal());
        assert_eq!(vec!["example", "com"], d.labels().collect::<Vec<_>>());
        assert!(d.eq_str("EXAMPLE.COM"));
    }
}
