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

//! The SMTP session: one connection, one state machine.
//!
//! The session owns the framed reader/writer, runs the greeting policy,
//! sequences the verbs, ingests message data via DATA or BDAT, and hands
//! accepted messages to the Maildir. Policy failures arrive as
//! `SmtpResponse` values from the predicates in `policy`; this is the only
//! module that writes to the wire or decides to end the connection.

use std::borrow::Cow;
use std::cell::RefCell;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::sync::mpsc;

use super::classify;
use super::codes::*;
use super::policy::{ConnectionInfo, Policy, SenderInfo, Verdict};
use super::psl::PublicSuffixList;
use super::syntax::{
    Command, Domain, Mailbox, Param, ParseError, ParseErrorKind,
};
use crate::support::{
    async_io::ServerIo,
    dns,
    error::Error,
    log_prefix::LogPrefix,
    maildir::Message,
    system_config::{
        SystemConfig, READ_TIMEOUT, STARTTLS_TIMEOUT, WRITE_TIMEOUT,
    },
};

/// Cap on one command line, including the CRLF.
const MAX_LINE: usize = 1024;
/// Largest single read while ingesting message data.
const MAX_XFER: usize = 64 * 1024;

/// The session states of RFC 5321 § 4.1.4, plus the latched error state of
/// RFC 3030 § 3 which only RSET (or a fresh HELO/EHLO) clears.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// No identity yet; only HELO/EHLO accepted.
    Helo,
    /// Identity known; awaiting MAIL.
    Mail,
    /// Reverse path known; awaiting the first RCPT.
    Rcpt,
    /// At least one recipient; RCPT, DATA and BDAT accepted.
    Data,
    /// Mid-way through a BDAT chunk sequence.
    Bdat,
    /// A failed chunk sequence; everything rejected until RSET.
    Rset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response which needs to be sent immediately.
    ///
    /// Forces a flush, but also indicates continuation.
    Urgent,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, last: bool) -> Self {
        if last {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Urgent | Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

#[derive(Debug, PartialEq, Eq)]
enum DataEnd {
    Done,
    BareLf,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct DataStats {
    /// Octets consumed from the wire, including the stuffing and the end
    /// marker.
    octets: u64,
    /// Size of the header block, up to the cap.
    hdr_size: u64,
    /// Whether the blank line ending the header block was seen.
    hdr_end: bool,
}

/// Copies the dot-stuffed DATA payload from `src` into `dst`, consuming up
/// to and including the `.` terminator line.
///
/// CRLF discipline is strict: the only LF allowed is the second half of a
/// CRLF, so arbitrary binary content survives exactly — and a bare LF is
/// stream corruption, reported for the caller to treat as fatal.
async fn copy_with_dot_stuffing(
    mut dst: impl io::Write,
    src: &mut (impl tokio::io::AsyncBufRead + Unpin),
    max_hdr_size: u64,
) -> io::Result<(DataEnd, DataStats)> {
    // True at the beginning and after each CRLF.
    let mut start_of_line = true;
    // Whether the last read ended with CR, so an LF alone in the next read
    // still completes a CRLF.
    let mut has_trailing_cr = false;

    let mut stats = DataStats::default();

    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        (&mut *src)
            .take(MAX_XFER as u64)
            .read_until(b'\n', &mut buffer)
            .await?;
        if buffer.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            ));
        }
        stats.octets += buffer.len() as u64;

        if buffer.ends_with(b"\n") {
            let proper = buffer.ends_with(b"\r\n")
                || (b"\n" == &buffer[..] && has_trailing_cr);
            if !proper {
                return Ok((DataEnd::BareLf, stats));
            }
        }

        if start_of_line {
            if b".\r\n" == &buffer[..] {
                return Ok((DataEnd::Done, stats));
            }

            if b"\r\n" == &buffer[..] {
                stats.hdr_end = true;
            }

            let content = if b'.' == buffer[0] {
                &buffer[1..]
            } else {
                &buffer[..]
            };
            if !stats.hdr_end && stats.hdr_size < max_hdr_size {
                stats.hdr_size += content.len() as u64;
            }
            dst.write_all(content)?;
        } else {
            dst.write_all(&buffer)?;
        }

        start_of_line = buffer.ends_with(b"\n");
        has_trailing_cr = buffer.ends_with(b"\r");
    }
}

/// Routes the payload into a `Message`, swallowing write failures so the
/// stream keeps flowing; the message latches its first error and reports it
/// at save time.
struct LatchingSink<'a>(&'a mut Message);

impl io::Write for LatchingSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.0.write(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Everything `Session::new` needs; the test harness builds this directly
/// with an injected DNS cache and synthetic peer address.
pub struct SessionParams {
    pub io: ServerIo,
    pub config: Arc<SystemConfig>,
    /// Directory holding the cdb policy lists and the public suffix list.
    pub lists_dir: PathBuf,
    pub maildir: PathBuf,
    pub log_prefix: LogPrefix,
    pub ssl_acceptor: Option<SslAcceptor>,
    pub peer_ip: Option<IpAddr>,
    pub us_ip: Option<IpAddr>,
    pub resolver: Option<Rc<dns::Resolver>>,
    pub dns_cache: Rc<RefCell<dns::Cache>>,
}

pub struct Session {
    io: BufStream<ServerIo>,
    /// A second handle on the same connection, for STARTTLS and readiness
    /// probes which must bypass the buffers.
    raw_io: ServerIo,
    config: Arc<SystemConfig>,
    lists_dir: PathBuf,
    maildir: PathBuf,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
    psl: PublicSuffixList,
    dns_cache: Rc<RefCell<dns::Cache>>,
    resolver: Option<Rc<dns::Resolver>>,

    peer_ip: Option<IpAddr>,
    them_literal: String,
    us_literal: String,
    server_identity: String,

    state: State,
    conn: ConnectionInfo,
    client_identity: Option<Domain>,
    /// Printable peer identification for logs and the Received header.
    client_display: String,
    /// Whether the client used EHLO rather than HELO.
    extensions: bool,
    smtputf8: bool,
    binarymime: bool,
    reverse_path: Option<Option<Mailbox>>,
    forward_path: Vec<Mailbox>,
    sender_info: SenderInfo,
    unrecognized_cmds: u32,
    max_msg_size: u64,
    quit: bool,

    /// The in-flight message during a BDAT sequence.
    msg: Option<Message>,

    bytes_in: u64,
    bytes_out: u64,

    deadline_tx: mpsc::Sender<Instant>,
    deadline_rx: Option<mpsc::Receiver<Instant>>,
}

impl Session {
    pub fn new(params: SessionParams) -> Result<Self, Error> {
        let SessionParams {
            io,
            config,
            lists_dir,
            maildir,
            log_prefix,
            ssl_acceptor,
            peer_ip,
            us_ip,
            resolver,
            dns_cache,
        } = params;

        let server_identity =
            determine_server_identity(&config.smtp.host_name, us_ip)
                .ok_or(Error::NoServerIdentity)?;

        let them_literal =
            peer_ip.map(address_literal_of).unwrap_or_default();
        let us_literal = us_ip
            .map(address_literal_of)
            .unwrap_or_else(|| "[127.0.0.1]".to_owned());

        if let Some(ip) = peer_ip {
            log_prefix.set_peer(ip.to_string());
        }

        let psl = PublicSuffixList::load(&lists_dir);
        let max_msg_size = config.smtp.max_msg_size;
        let (deadline_tx, deadline_rx) = mpsc::channel(1);

        Ok(Self {
            io: BufStream::new(io.clone()),
            raw_io: io,
            config,
            lists_dir,
            maildir,
            log_prefix,
            ssl_acceptor,
            psl,
            dns_cache,
            resolver,

            peer_ip,
            them_literal,
            us_literal,
            server_identity,

            state: State::Helo,
            conn: ConnectionInfo::default(),
            client_identity: None,
            client_display: "unknown".to_owned(),
            extensions: false,
            smtputf8: false,
            binarymime: false,
            reverse_path: None,
            forward_path: Vec::new(),
            sender_info: SenderInfo::default(),
            unrecognized_cmds: 0,
            max_msg_size,
            quit: false,

            msg: None,

            bytes_in: 0,
            bytes_out: 0,

            deadline_tx,
            deadline_rx: Some(deadline_rx),
        })
    }

    pub async fn run(&mut self) -> Result<(), Error> {
        let mut deadline_rx =
            self.deadline_rx.take().expect("run() called twice");

        {
            let run = self.run_();
            tokio::pin!(run);

            tokio::select! {
                r = &mut run => {
                    return r;
                },
                _ = idle_timer(&mut deadline_rx) => {},
            }
        }

        // The command loop was abandoned mid-await; the deadline passed.
        self.time_out().await
    }

    async fn run_(&mut self) -> Result<(), Error> {
        self.send_greeting().await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        info!(
            "{} session done, {} octets in, {} octets out",
            self.log_prefix, self.bytes_in, self.bytes_out,
        );
        Ok(())
    }

    fn tls(&self) -> bool {
        self.raw_io.tls()
    }

    fn policy(&self) -> Policy<'_> {
        Policy {
            config: &self.config.smtp,
            lists_dir: &self.lists_dir,
            psl: &self.psl,
            cache: &self.dns_cache,
            resolver: self.resolver.as_ref(),
            log_prefix: &self.log_prefix,
            server_identity: &self.server_identity,
        }
    }

    /// Connection establishment gets exactly two reply codes: 220 or 554
    /// (RFC 5321 § 3.1) — plus 421 for clients that talk out of turn.
    async fn send_greeting(&mut self) -> Result<(), Error> {
        let _ = self
            .deadline_tx
            .send(Instant::now() + Duration::from_secs(60))
            .await;

        if let Some(ip) = self.peer_ip {
            let result = self.policy().verify_ip_address(ip).await;
            match result {
                Ok(conn) => self.conn = conn,
                Err(response) => {
                    self.send_response(Final, response).await?;
                    self.quit = true;
                    return Ok(());
                },
            }

            self.client_display = match self.conn.fcrdns.first() {
                Some(name) => {
                    format!("{} {}", name, self.them_literal)
                },
                None => format!("unknown {}", self.them_literal),
            };

            if !self.conn.ip_whitelisted && !self.conn.fcrdns_whitelisted {
                // Half a greeting, then quietly watch for clients that
                // blurt before being spoken to.
                self.send_response(
                    Urgent,
                    SmtpResponse(
                        pc::ServiceReady,
                        None,
                        Cow::Owned(format!(
                            "{} ESMTP",
                            self.server_identity,
                        )),
                    ),
                )
                .await?;

                if self
                    .raw_io
                    .input_ready(self.config.smtp.greeting_wait())
                    .await
                {
                    warn!(
                        "{} input before greeting",
                        self.log_prefix,
                    );
                    self.send_response(
                        Final,
                        SmtpResponse(
                            pc::ServiceNotAvailableClosing,
                            Some((
                                cc::TempFail,
                                sc::SystemNotAcceptingNetworkMessages,
                            )),
                            Cow::Borrowed("not accepting network messages"),
                        ),
                    )
                    .await?;
                    return Ok(());
                }
            }
        }

        self.send_response(
            Final,
            SmtpResponse(
                pc::ServiceReady,
                None,
                Cow::Owned(format!(
                    "{} ESMTP - smtpin",
                    self.server_identity,
                )),
            ),
        )
        .await
    }

    async fn run_command(
        &mut self,
        buffer: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let _ = self
            .deadline_tx
            .send(Instant::now() + READ_TIMEOUT)
            .await;

        // Buffered group replies must reach the client before we block
        // waiting for its next command (RFC 2920 § 3.1); if more input is
        // already here, the group is still in progress.
        if !self.input_pending() {
            self.flush().await?;
        }

        buffer.clear();
        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }
        self.bytes_in += buffer.len() as u64;

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                self.send_response(
                    Final,
                    SmtpResponse(
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::SyntaxError)),
                        Cow::Borrowed("command line too long"),
                    ),
                )
                .await?;

                // Skip the rest of the line
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                    self.bytes_in += buffer.len() as u64;
                }

                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        if !buffer.ends_with(b"\r\n") {
            return self.bare_lf().await;
        }

        let command_line = &buffer[..buffer.len() - 2];
        if command_line.contains(&0) {
            warn!(
                "{} remote is speaking binary, closing connection",
                self.log_prefix,
            );
            self.quit = true;
            return Ok(());
        }

        let Ok(command_line) = std::str::from_utf8(command_line) else {
            let lossy =
                String::from_utf8_lossy(command_line).into_owned();
            return self.cmd_unrecognized(&lossy).await;
        };

        let command = match command_line.parse::<Command>() {
            Ok(command) => command,
            Err(ParseError {
                kind: ParseErrorKind::UnknownCommand,
                ..
            }) => {
                let line = command_line.to_owned();
                return self.cmd_unrecognized(&line).await;
            },
            Err(e) => {
                warn!(
                    "{} bad command {:?}: {}",
                    self.log_prefix,
                    truncated(command_line, 64),
                    e,
                );
                return self
                    .send_response(
                        Final,
                        SmtpResponse(
                            pc::ParameterSyntaxError,
                            Some((
                                cc::PermFail,
                                sc::InvalidCommandArguments,
                            )),
                            Cow::Owned(e.to_string()),
                        ),
                    )
                    .await;
            },
        };

        match command {
            Command::Helo(domain) => self.cmd_helo(domain, false).await,
            Command::Ehlo(domain) => self.cmd_helo(domain, true).await,
            Command::MailFrom(path, params) => {
                self.cmd_mail(path, params).await
            },
            Command::RcptTo(mailbox, params) => {
                self.cmd_rcpt(mailbox, params).await
            },
            Command::Data => self.cmd_data().await,
            Command::Bdat { size, last } => {
                self.cmd_bdat(size, last).await
            },
            Command::Rset => self.cmd_rset().await,
            Command::Noop(arg) => self.cmd_noop(arg).await,
            Command::Vrfy(arg) => self.cmd_vrfy(arg).await,
            Command::Help(arg) => self.cmd_help(arg).await,
            Command::StartTls => self.cmd_starttls().await,
            Command::Quit => self.cmd_quit().await,
            Command::Auth(arg) => self.cmd_auth(arg).await,
        }
    }

    async fn cmd_helo(
        &mut self,
        identity: Domain,
        extended: bool,
    ) -> Result<(), Error> {
        let verb = if extended { "EHLO" } else { "HELO" };
        self.check_pipelining(verb);

        self.reset_transaction();
        self.extensions = extended;
        self.log_prefix.set_helo(identity.utf8().to_owned());

        let result =
            self.policy()
                .verify_client(&identity, &self.conn, self.peer_ip);
        if let Err(response) = result {
            warn!(
                "{} {} failed for {}",
                self.log_prefix, verb, identity,
            );
            self.send_response(Final, response).await?;
            self.quit = true;
            return Ok(());
        }

        info!("{} {} {}", self.log_prefix, verb, identity);
        self.client_identity = Some(identity);
        self.state = State::Mail;

        if extended {
            let salutation = if self.peer_ip.is_some() {
                format!(
                    "{} at your service, {}",
                    self.server_identity, self.client_display,
                )
            } else {
                format!("{} at your service", self.server_identity)
            };
            self.send_response(
                Delayable,
                SmtpResponse(pc::Ok, None, Cow::Owned(salutation)),
            )
            .await?;

            let extensions = self.extension_lines();
            let count = extensions.len();
            for (ix, extension) in extensions.into_iter().enumerate() {
                self.send_response(
                    Delayable.or_final(ix + 1 == count),
                    SmtpResponse(pc::Ok, None, Cow::Owned(extension)),
                )
                .await?;
            }
        } else {
            let id = self.server_identity.clone();
            self.send_response(
                Final,
                SmtpResponse(pc::Ok, None, Cow::Owned(id)),
            )
            .await?;
        }

        Ok(())
    }

    fn extension_lines(&self) -> Vec<String> {
        let mut extensions = vec![
            format!("SIZE {}", self.max_msg_size), // RFC 1870
            "8BITMIME".to_owned(),                 // RFC 6152
        ];
        if self.tls() {
            extensions.push("REQUIRETLS".to_owned()); // RFC 8689
        } else if self.ssl_acceptor.is_some() {
            // If we're not already TLS, offer TLS, à la RFC 3207.
            extensions.push("STARTTLS".to_owned());
        }
        extensions.push("ENHANCEDSTATUSCODES".to_owned()); // RFC 2034
        extensions.push("PIPELINING".to_owned()); // RFC 2920
        extensions.push("BINARYMIME".to_owned()); // RFC 3030
        extensions.push("CHUNKING".to_owned()); // RFC 3030
        extensions.push("SMTPUTF8".to_owned()); // RFC 6531
        extensions
    }

    async fn cmd_mail(
        &mut self,
        path: Option<Mailbox>,
        params: Vec<Param>,
    ) -> Result<(), Error> {
        match self.state {
            State::Mail => (),
            State::Helo => {
                return self
                    .sequence_error("'MAIL FROM' before 'HELO' or 'EHLO'")
                    .await;
            },
            State::Rcpt | State::Data => {
                return self.sequence_error("nested MAIL command").await;
            },
            State::Bdat => {
                return self
                    .sequence_error("MAIL during BDAT sequence")
                    .await;
            },
            State::Rset => {
                return self
                    .sequence_error("RSET required after failed BDAT")
                    .await;
            },
        }

        let mut smtputf8 = false;
        let mut binarymime = false;

        for param in &params {
            if param.name.eq_ignore_ascii_case("BODY") {
                match param.value.as_deref() {
                    Some(v) if v.eq_ignore_ascii_case("8BITMIME") => {
                        // everything is cool, this is our default
                    },
                    Some(v) if v.eq_ignore_ascii_case("7BIT") => {
                        // nothing to see here, move along
                    },
                    Some(v) if v.eq_ignore_ascii_case("BINARYMIME") => {
                        binarymime = true;
                    },
                    other => {
                        warn!(
                            "{} unrecognized BODY type {:?} requested",
                            self.log_prefix, other,
                        );
                    },
                }
            } else if param.name.eq_ignore_ascii_case("SMTPUTF8") {
                if let Some(ref value) = param.value {
                    warn!(
                        "{} SMTPUTF8 parameter has a value: {}",
                        self.log_prefix, value,
                    );
                }
                smtputf8 = true;
            } else if param.name.eq_ignore_ascii_case("SIZE") {
                match param.value.as_deref().map(str::parse::<u64>) {
                    Some(Ok(size)) if size > self.max_msg_size => {
                        warn!(
                            "{} SIZE parameter too large: {}",
                            self.log_prefix, size,
                        );
                        return self
                            .send_response(
                                Final,
                                SmtpResponse(
                                    pc::ExceededStorageAllocation,
                                    Some((
                                        cc::PermFail,
                                        sc::MessageTooBigForSystem,
                                    )),
                                    Cow::Borrowed(
                                        "message size exceeds maximum size",
                                    ),
                                ),
                            )
                            .await;
                    },
                    Some(Ok(_)) => (),
                    bad => {
                        // I guess we just ignore bad size parameters.
                        warn!(
                            "{} SIZE parameter has invalid value: {:?}",
                            self.log_prefix, bad,
                        );
                    },
                }
            } else if param.name.eq_ignore_ascii_case("REQUIRETLS") {
                if !self.tls() {
                    return self
                        .send_response(
                            Final,
                            SmtpResponse(
                                pc::TransactionFailed,
                                Some((
                                    cc::PermFail,
                                    sc::DeliveryNotAuthorised,
                                )),
                                Cow::Borrowed(
                                    "REQUIRETLS needs a TLS session",
                                ),
                            ),
                        )
                        .await;
                }
            } else {
                warn!(
                    "{} unrecognized MAIL FROM parameter {}",
                    self.log_prefix, param,
                );
            }
        }

        self.smtputf8 = smtputf8;
        self.binarymime = binarymime;

        let result = self
            .policy()
            .verify_sender(
                path.as_ref(),
                self.client_identity.as_ref().expect("state is Mail"),
                &self.conn,
                self.peer_ip,
                &self.them_literal,
            )
            .await;

        match result {
            Err(response) => {
                error!(
                    "{} ** Failed! ** MAIL FROM:<{}>",
                    self.log_prefix,
                    reverse_path_str(&path),
                );
                self.send_response(Final, response).await?;
                self.quit = true;
            },
            Ok(sender_info) => {
                let mut params_str = String::new();
                for param in &params {
                    params_str.push(' ');
                    params_str.push_str(&param.to_string());
                }
                info!(
                    "{} MAIL FROM:<{}>{}",
                    self.log_prefix,
                    reverse_path_str(&path),
                    params_str,
                );

                self.sender_info = sender_info;
                self.reverse_path = Some(path);
                self.forward_path.clear();
                self.state = State::Rcpt;
                // No flush: RFC 2920 § 3.1, this could be part of a
                // command group.
                self.send_response(
                    Delayable,
                    SmtpResponse(
                        pc::Ok,
                        Some((cc::Success, sc::OtherAddressStatus)),
                        Cow::Borrowed("MAIL FROM OK"),
                    ),
                )
                .await?;
            },
        }

        Ok(())
    }

    async fn cmd_rcpt(
        &mut self,
        mailbox: Mailbox,
        params: Vec<Param>,
    ) -> Result<(), Error> {
        match self.state {
            State::Rcpt | State::Data => (),
            State::Helo => {
                return self
                    .sequence_error("'RCPT TO' before 'HELO' or 'EHLO'")
                    .await;
            },
            State::Mail => {
                return self
                    .sequence_error("'RCPT TO' before 'MAIL FROM'")
                    .await;
            },
            State::Bdat => {
                return self
                    .sequence_error("RCPT during BDAT sequence")
                    .await;
            },
            State::Rset => {
                return self
                    .sequence_error("RSET required after failed BDAT")
                    .await;
            },
        }

        // We don't accept any RCPT TO parameters.
        for param in &params {
            warn!(
                "{} unrecognized 'RCPT TO' parameter {}",
                self.log_prefix, param,
            );
        }

        if self.forward_path.len()
            >= self.config.smtp.max_recipients_per_message
        {
            warn!(
                "{} too many recipients <{}>",
                self.log_prefix, mailbox,
            );
            return self
                .send_response(
                    Delayable,
                    SmtpResponse(
                        pc::InsufficientStorage,
                        Some((cc::TempFail, sc::TooManyRecipients)),
                        Cow::Borrowed("too many recipients"),
                    ),
                )
                .await;
        }

        let verdict =
            self.policy().verify_recipient(&mailbox, &self.us_literal);
        match verdict {
            Verdict::Ok => {
                info!("{} RCPT TO:<{}>", self.log_prefix, mailbox);
                self.forward_path.push(mailbox);
                self.state = State::Data;
                // No flush: RFC 2920 § 3.1, this could be part of a
                // command group.
                self.send_response(
                    Delayable,
                    SmtpResponse(
                        pc::Ok,
                        Some((cc::Success, sc::DestinationAddressValid)),
                        Cow::Borrowed("RCPT TO OK"),
                    ),
                )
                .await
            },
            Verdict::Reject(response) => {
                // Lenient on most bad recipients; the session continues.
                self.send_response(Delayable, response).await
            },
            Verdict::Fatal(response) => {
                self.send_response(Final, response).await?;
                self.quit = true;
                Ok(())
            },
        }
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        self.check_pipelining("DATA");

        match self.state {
            State::Data => (),
            State::Helo => {
                return self
                    .sequence_error("'DATA' before 'HELO' or 'EHLO'")
                    .await;
            },
            State::Mail => {
                return self
                    .sequence_error("need 'MAIL FROM' before 'DATA'")
                    .await;
            },
            State::Rcpt => {
                return self
                    .sequence_error("need 'RCPT TO' before 'DATA'")
                    .await;
            },
            State::Bdat => {
                // RFC 3030 § 3: DATA may not mix with chunking; the
                // sequence is dead until RSET.
                self.reset_message();
                self.state = State::Rset;
                return self
                    .sequence_error("DATA during BDAT sequence")
                    .await;
            },
            State::Rset => {
                return self
                    .sequence_error("RSET required after failed BDAT")
                    .await;
            },
        }

        if self.binarymime {
            return self
                .sequence_error("DATA does not support BINARYMIME")
                .await;
        }

        let mut msg = match self.open_message().await {
            Ok(msg) => msg,
            Err(e) => return self.fs_error(e).await,
        };

        self.send_response(
            Final,
            SmtpResponse(
                pc::StartMailInput,
                None,
                Cow::Borrowed("go, end with <CR><LF>.<CR><LF>"),
            ),
        )
        .await?;
        info!("{} DATA", self.log_prefix);

        let _ = self
            .deadline_tx
            .send(Instant::now() + Duration::from_secs(1800))
            .await;

        match self.copy_data(&mut msg).await? {
            DataEnd::BareLf => {
                msg.trash();
                self.bare_lf().await
            },
            DataEnd::Done if msg.size_error() => {
                msg.trash();
                warn!("{} DATA size error", self.log_prefix);
                self.reset_transaction();
                self.send_response(
                    Final,
                    SmtpResponse(
                        pc::ExceededStorageAllocation,
                        Some((
                            cc::PermFail,
                            sc::MessageTooBigForSystem,
                        )),
                        Cow::Borrowed("message size limit exceeded"),
                    ),
                )
                .await
            },
            DataEnd::Done => {
                let id = msg.id().to_owned();
                let size = msg.size();
                if let Err(e) = msg.save() {
                    return self.fs_error(e).await;
                }

                info!(
                    "{} message delivered, {} octets, with id {}",
                    self.log_prefix, size, id,
                );
                self.reset_transaction();
                self.send_response(
                    Final,
                    SmtpResponse(
                        pc::Ok,
                        Some((cc::Success, sc::Undefined)),
                        Cow::Borrowed("DATA OK"),
                    ),
                )
                .await
            },
        }
    }

    /// Consumes the dot-stuffed DATA payload into `msg`.
    async fn copy_data(
        &mut self,
        msg: &mut Message,
    ) -> Result<DataEnd, Error> {
        let max_hdr_size = self.config.smtp.max_hdr_size;
        let (end, stats) = copy_with_dot_stuffing(
            LatchingSink(msg),
            &mut self.io,
            max_hdr_size,
        )
        .await?;
        self.bytes_in += stats.octets;

        if let DataEnd::Done = end {
            if stats.hdr_end {
                info!(
                    "{} header size {} octets",
                    self.log_prefix, stats.hdr_size,
                );
            } else {
                warn!(
                    "{} may not have all headers in this message",
                    self.log_prefix,
                );
            }
        }

        Ok(end)
    }

    async fn cmd_bdat(
        &mut self,
        size: u64,
        last: bool,
    ) -> Result<(), Error> {
        // Extend the deadline to account for a 32kbps transfer rate.
        let _ = self
            .deadline_tx
            .send(
                Instant::now() + Duration::from_secs(30 + size / 4000),
            )
            .await;

        info!(
            "{} BDAT {}{}",
            self.log_prefix,
            size,
            if last { " LAST" } else { "" },
        );

        match self.state {
            State::Bdat => (),
            State::Data => {
                // First chunk of the sequence.
                match self.open_message().await {
                    Ok(msg) => {
                        self.msg = Some(msg);
                        self.state = State::Bdat;
                    },
                    Err(e) => {
                        self.discard_exact(size).await?;
                        self.state = State::Rset;
                        return self.fs_error(e).await;
                    },
                }
            },
            State::Helo | State::Mail | State::Rcpt | State::Rset => {
                // Whatever happens, the declared octets must be consumed
                // to keep the stream aligned.
                self.discard_exact(size).await?;

                let text = match self.state {
                    State::Helo => "'BDAT' before 'HELO' or 'EHLO'",
                    State::Mail => "need 'MAIL FROM' before 'BDAT'",
                    State::Rcpt => "need 'RCPT TO' before 'BDAT'",
                    _ => "BDAT sequence error",
                };
                self.state = State::Rset;
                return self.sequence_error(text).await;
            },
        }

        let mut msg = self.msg.take().expect("in BDAT state without msg");
        self.copy_exact(&mut msg, size).await?;

        if msg.size_error() {
            msg.trash();
            warn!("{} BDAT size error", self.log_prefix);
            self.state = State::Rset;
            return self
                .send_response(
                    Final,
                    SmtpResponse(
                        pc::ExceededStorageAllocation,
                        Some((cc::PermFail, sc::MessageTooBigForSystem)),
                        Cow::Borrowed("message size limit exceeded"),
                    ),
                )
                .await;
        }

        if last {
            let id = msg.id().to_owned();
            let total = msg.size();
            if let Err(e) = msg.save() {
                self.state = State::Rset;
                return self.fs_error(e).await;
            }

            info!(
                "{} message delivered, {} octets, with id {}",
                self.log_prefix, total, id,
            );
            self.reset_transaction();
            self.send_response(
                Final,
                SmtpResponse(
                    pc::Ok,
                    Some((cc::Success, sc::Undefined)),
                    Cow::Owned(format!("{} LAST OK", size)),
                ),
            )
            .await
        } else {
            self.msg = Some(msg);
            self.send_response(
                Final,
                SmtpResponse(
                    pc::Ok,
                    Some((cc::Success, sc::Undefined)),
                    Cow::Owned(format!("{} OK", size)),
                ),
            )
            .await
        }
    }

    /// Reads exactly `size` octets into `msg` — no framing, no
    /// dot-stuffing, no line-break translation.
    async fn copy_exact(
        &mut self,
        msg: &mut Message,
        size: u64,
    ) -> Result<(), Error> {
        let mut buf = [0u8; 4096];
        let mut remaining = size;
        while remaining > 0 {
            let max = usize::try_from(remaining)
                .unwrap_or(buf.len())
                .min(buf.len());
            let nread = self.io.read(&mut buf[..max]).await?;
            if 0 == nread {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF before end of BDAT chunk",
                )));
            }

            remaining -= nread as u64;
            self.bytes_in += nread as u64;
            if let Err(e) = msg.write(&buf[..nread]) {
                error!(
                    "{} buffering message failed: {}",
                    self.log_prefix, e,
                );
            }
        }

        Ok(())
    }

    async fn discard_exact(&mut self, size: u64) -> Result<(), Error> {
        let nread = tokio::io::copy(
            &mut (&mut self.io).take(size),
            &mut tokio::io::sink(),
        )
        .await?;
        self.bytes_in += nread;
        if nread != size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF before end of BDAT chunk",
            )));
        }
        Ok(())
    }

    /// Classifies the message, opens its Maildir file, and writes the
    /// added headers.
    async fn open_message(&mut self) -> Result<Message, io::Error> {
        let verdict = {
            let signals = classify::Signals {
                tls: self.tls(),
                client_identity: self.client_identity.as_ref(),
                fcrdns: &self.conn.fcrdns,
                spf_result: self.sender_info.spf_result,
                spf_domain: self.sender_info.spf_domain.as_deref(),
                ip_whitelisted: self.conn.ip_whitelisted,
            };
            classify::classify(&signals, &self.lists_dir, &self.psl)
        };

        if verdict.is_ham() {
            // All sources of ham get a fresh 5 minute timeout per message.
            let _ = self
                .deadline_tx
                .send(Instant::now() + READ_TIMEOUT)
                .await;
        }

        let mut msg = Message::open(
            &self.maildir,
            &self.server_identity,
            self.max_msg_size,
            verdict.folder(),
        )?;
        let headers = self.added_headers(&msg, verdict.header());
        msg.write(headers.as_bytes())?;
        Ok(msg)
    }

    /// The Return-Path, Received, Received-SPF and X-Spam-Status headers
    /// prefixed to each accepted message (STD 3 § 5.2.8).
    fn added_headers(&self, msg: &Message, spam_header: String) -> String {
        use std::fmt::Write as _;

        let mut headers = String::new();
        let _ = write!(
            headers,
            "Return-Path: <{}>\r\n",
            match self.reverse_path {
                Some(Some(ref mailbox)) => mailbox.to_string(),
                _ => String::new(),
            },
        );

        let _ = write!(
            headers,
            "Received: from {}",
            self.client_identity
                .as_ref()
                .map(Domain::utf8)
                .unwrap_or("unknown"),
        );
        if self.peer_ip.is_some() {
            let _ = write!(headers, " ({})", self.client_display);
        }
        let _ = write!(
            headers,
            "\r\n        by {} with {} id {}",
            self.server_identity,
            protocol_name(self.smtputf8, self.extensions, self.tls()),
            msg.id(),
        );

        if !self.forward_path.is_empty() {
            let mut len = 12;
            headers.push_str("\r\n        for ");
            for (i, forward) in self.forward_path.iter().enumerate() {
                let forward = forward.to_string();
                if i > 0 {
                    headers.push(',');
                    len += 1;
                }
                if (len + forward.len() + 2) > 80 {
                    headers.push_str("\r\n        ");
                    len = 8;
                }
                let _ = write!(headers, "<{}>", forward);
                len += forward.len() + 2;
            }
        }

        if let Some(tls_info) = self.raw_io.tls_info() {
            let _ = write!(headers, "\r\n        ({})", tls_info);
        }
        let _ = write!(
            headers,
            ";\r\n        {}\r\n",
            msg.when().to_rfc2822(),
        );

        if let Some(ref received_spf) = self.sender_info.received_spf {
            headers.push_str(received_spf);
            headers.push_str("\r\n");
        }

        headers.push_str(&spam_header);
        headers.push_str("\r\n");

        headers
    }

    async fn cmd_rset(&mut self) -> Result<(), Error> {
        self.reset_transaction();
        info!("{} RSET", self.log_prefix);
        // No flush: RFC 2920 § 3.1, this could be part of a command group.
        self.send_response(
            Delayable,
            SmtpResponse(
                pc::Ok,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed("OK"),
            ),
        )
        .await
    }

    async fn cmd_noop(
        &mut self,
        arg: Option<String>,
    ) -> Result<(), Error> {
        self.check_pipelining("NOOP");
        info!(
            "{} NOOP{}{}",
            self.log_prefix,
            if arg.is_some() { " " } else { "" },
            arg.as_deref().unwrap_or(""),
        );
        self.send_response(
            Final,
            SmtpResponse(
                pc::Ok,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed("OK"),
            ),
        )
        .await
    }

    async fn cmd_vrfy(
        &mut self,
        arg: Option<String>,
    ) -> Result<(), Error> {
        self.check_pipelining("VRFY");
        info!(
            "{} VRFY{}{}",
            self.log_prefix,
            if arg.is_some() { " " } else { "" },
            arg.as_deref().unwrap_or(""),
        );
        self.send_response(
            Final,
            SmtpResponse(
                pc::CannotVerify,
                Some((cc::Success, sc::DestinationAddressValid)),
                Cow::Borrowed("try it"),
            ),
        )
        .await
    }

    async fn cmd_help(
        &mut self,
        arg: Option<String>,
    ) -> Result<(), Error> {
        info!(
            "{} HELP{}{}",
            self.log_prefix,
            if arg.is_some() { " " } else { "" },
            arg.as_deref().unwrap_or(""),
        );
        self.send_response(
            Final,
            SmtpResponse(
                pc::HelpMessage,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed(
                    "see https://tools.ietf.org/html/rfc5321",
                ),
            ),
        )
        .await
    }

    async fn cmd_starttls(&mut self) -> Result<(), Error> {
        self.check_pipelining("STARTTLS");

        if self.tls() {
            warn!(
                "{} STARTTLS issued with TLS already active",
                self.log_prefix,
            );
            return self
                .send_response(
                    Final,
                    SmtpResponse(
                        pc::TransactionFailed,
                        Some((cc::PermFail, sc::InvalidCommand)),
                        Cow::Borrowed("TLS already active"),
                    ),
                )
                .await;
        }

        if State::Rset == self.state {
            return self
                .sequence_error("RSET required after failed BDAT")
                .await;
        }

        let Some(acceptor) = self.ssl_acceptor.take() else {
            return self
                .send_response(
                    Final,
                    SmtpResponse(
                        pc::AuthenticationFailure,
                        Some((
                            cc::TempFail,
                            sc::SecurityFeaturesNotSupported,
                        )),
                        Cow::Borrowed("TLS not available"),
                    ),
                )
                .await;
        };

        self.send_response(
            Final,
            SmtpResponse(
                pc::ServiceReady,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed("go for TLS"),
            ),
        )
        .await?;

        match tokio::time::timeout(
            STARTTLS_TIMEOUT,
            self.raw_io.ssl_accept(&acceptor),
        )
        .await
        {
            Ok(Ok(())) => (),
            Ok(Err(e)) => {
                warn!("{} TLS handshake failed: {}", self.log_prefix, e);
                return Err(e);
            },
            Err(_elapsed) => {
                warn!("{} TLS handshake timed out", self.log_prefix);
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "TLS handshake timed out",
                )));
            },
        }

        // Nothing read before the handshake may survive it: a cleartext
        // attacker must not be able to stuff commands into the TLS
        // session.
        self.io = BufStream::new(self.raw_io.clone());
        // RFC 3207 wants the protocol reset; the client identity survives.
        self.reset_transaction();
        self.max_msg_size = self.config.smtp.max_msg_size_tls;

        info!(
            "{} STARTTLS {}",
            self.log_prefix,
            self.raw_io.tls_info().unwrap_or_default(),
        );
        Ok(())
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.check_pipelining("QUIT");
        info!("{} QUIT", self.log_prefix);
        self.quit = true;
        self.send_response(
            Final,
            SmtpResponse(
                pc::ServiceClosing,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed("closing connection"),
            ),
        )
        .await
    }

    async fn cmd_auth(&mut self, _arg: String) -> Result<(), Error> {
        warn!("{} rejected AUTH attempt", self.log_prefix);
        self.quit = true;
        self.send_response(
            Final,
            SmtpResponse(
                pc::AuthenticationFailure,
                Some((cc::TempFail, sc::OtherSecurity)),
                Cow::Borrowed("authentication failure"),
            ),
        )
        .await
    }

    async fn cmd_unrecognized(&mut self, line: &str) -> Result<(), Error> {
        let escaped = truncated(line, 64).escape_debug().to_string();
        error!(
            "{} command unrecognized: \"{}\"",
            self.log_prefix, escaped,
        );

        self.unrecognized_cmds += 1;
        if self.unrecognized_cmds
            >= self.config.smtp.max_unrecognized_cmds
        {
            error!(
                "{} {} unrecognized commands is too many",
                self.log_prefix, self.unrecognized_cmds,
            );
            self.quit = true;
            return self
                .send_response(
                    Final,
                    SmtpResponse(
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommand)),
                        Cow::Owned(format!(
                            "command unrecognized: \"{}\" exceeds limit",
                            escaped,
                        )),
                    ),
                )
                .await;
        }

        self.send_response(
            Final,
            SmtpResponse(
                pc::CommandSyntaxError,
                Some((cc::PermFail, sc::InvalidCommand)),
                Cow::Owned(format!(
                    "command unrecognized: \"{}\"",
                    escaped,
                )),
            ),
        )
        .await
    }

    /// Bare LF anywhere in the stream ends the conversation; the error
    /// code is the one Office 365 uses.
    async fn bare_lf(&mut self) -> Result<(), Error> {
        error!("{} bare LF", self.log_prefix);
        self.quit = true;
        self.send_response(
            Final,
            SmtpResponse(
                pc::TransactionFailed,
                Some((cc::PermFail, sc::BareLineFeed)),
                Cow::Borrowed("bare LF"),
            ),
        )
        .await
    }

    async fn time_out(&mut self) -> Result<(), Error> {
        error!("{} time-out", self.log_prefix);
        self.quit = true;
        let _ = self
            .send_response(
                Final,
                SmtpResponse(
                    pc::ServiceNotAvailableClosing,
                    Some((cc::TempFail, sc::BadConnection)),
                    Cow::Borrowed("time-out"),
                ),
            )
            .await;
        Ok(())
    }

    async fn sequence_error(&mut self, text: &str) -> Result<(), Error> {
        warn!("{} {}", self.log_prefix, text);
        self.send_response(
            Final,
            SmtpResponse(
                pc::BadSequenceOfCommands,
                Some((cc::PermFail, sc::InvalidCommand)),
                Cow::Owned(text.to_owned()),
            ),
        )
        .await
    }

    /// Filesystem trouble during delivery: a full disk is a polite 452,
    /// anything else is a 550.
    async fn fs_error(&mut self, e: io::Error) -> Result<(), Error> {
        self.reset_transaction();
        if Some(nix::libc::ENOSPC) == e.raw_os_error() {
            error!("{} mail system full: {}", self.log_prefix, e);
            self.send_response(
                Final,
                SmtpResponse(
                    pc::InsufficientStorage,
                    Some((cc::TempFail, sc::MailSystemFull)),
                    Cow::Borrowed("mail system full"),
                ),
            )
            .await
        } else {
            error!("{} mail system error: {}", self.log_prefix, e);
            self.send_response(
                Final,
                SmtpResponse(
                    pc::ActionNotTakenPermanent,
                    Some((cc::PermFail, sc::Undefined)),
                    Cow::Borrowed("mail system error"),
                ),
            )
            .await
        }
    }

    /// Drops the envelope and any half-received message. The client
    /// identity survives, so the state machine returns to `Mail` — or all
    /// the way to `Helo` when there has been no HELO yet.
    fn reset_transaction(&mut self) {
        self.reverse_path = None;
        self.forward_path.clear();
        self.binarymime = false;
        self.smtputf8 = false;
        self.sender_info = SenderInfo::default();
        self.reset_message();
        self.state = if self.client_identity.is_some() {
            State::Mail
        } else {
            State::Helo
        };
    }

    fn reset_message(&mut self) {
        if let Some(msg) = self.msg.take() {
            msg.trash();
        }
    }

    /// Logs a pipelining violation: input was already waiting when a verb
    /// that must end a command group arrived (RFC 2920 § 3.1).
    fn check_pipelining(&mut self, verb: &str) {
        if self.input_pending() {
            warn!(
                "{} pipelining error; input ready processing {}",
                self.log_prefix, verb,
            );
        }
    }

    /// Whether there is input available right now, without blocking or
    /// consuming anything.
    fn input_pending(&mut self) -> bool {
        use futures::FutureExt as _;

        match self.io.fill_buf().now_or_never() {
            Some(Ok(buffer)) => !buffer.is_empty(),
            _ => false,
        }
    }

    async fn send_response(
        &mut self,
        kind: ResponseKind,
        response: SmtpResponse<'_>,
    ) -> Result<(), Error> {
        use std::fmt::Write as _;

        if response.is_fatal() {
            self.quit = true;
        }

        let mut s = String::new();
        let _ =
            write!(s, "{}{}", response.0 as u16, kind.indicator());
        let _ = write!(s, "{}\r\n", response);

        self.bytes_out += s.len() as u64;
        self.io.write_all(s.as_bytes()).await?;
        match kind {
            Final | Urgent => self.flush().await?,
            Delayable => (),
        }

        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        match tokio::time::timeout(WRITE_TIMEOUT, self.io.flush()).await {
            Ok(result) => result.map_err(Error::Io),
            Err(_elapsed) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "write timed out",
            ))),
        }
    }
}

/// Resolves the name we hold ourselves out as.
///
/// `GHSMTP_SERVER_ID` wins, then the configured host name, then the machine
/// host name if it is fully qualified, then our own address literal when
/// the address is routable. With none of those there is no safe way to
/// operate.
pub fn determine_server_identity(
    configured: &str,
    us_ip: Option<IpAddr>,
) -> Option<String> {
    if let Ok(id) = std::env::var("GHSMTP_SERVER_ID") {
        if !id.is_empty() {
            return Some(id);
        }
    }

    if !configured.is_empty() {
        return Some(configured.to_owned());
    }

    if let Ok(hostname) = nix::unistd::gethostname() {
        if let Some(hostname) = hostname.to_str() {
            if hostname.contains('.') {
                return Some(hostname.to_owned());
            }
        }
    }

    match us_ip {
        Some(ip) if !ip.is_loopback() && !ip.is_unspecified() => {
            Some(address_literal_of(ip))
        },
        _ => None,
    }
}

fn address_literal_of(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("[{}]", v4),
        IpAddr::V6(v6) => format!("[IPv6:{}]", v6),
    }
}

fn reverse_path_str(path: &Option<Mailbox>) -> String {
    match path {
        Some(mailbox) => mailbox.to_string(),
        None => String::new(),
    }
}

/// The protocol token for the Received header, per the SMTPUTF8, ESMTP and
/// TLS combinations of RFC 3848 and friends.
fn protocol_name(
    smtputf8: bool,
    extensions: bool,
    tls: bool,
) -> &'static str {
    match (smtputf8, extensions, tls) {
        (true, _, true) => "UTF8SMTPS",
        (true, _, false) => "UTF8SMTP",
        (false, true, true) => "ESMTPS",
        (false, true, false) => "ESMTP",
        (false, false, true) => "SMTPS",
        (false, false, false) => "SMTP", // there is no SMTPS without E
    }
}

// Runs until either the deadline channel is closed or the current deadline
// has expired. Used to force-close idle connections.
async fn idle_timer(deadline_rx: &mut mpsc::Receiver<Instant>) {
    let mut deadline = Instant::now() + Duration::from_secs(30);

    loop {
        match tokio::time::timeout_at(deadline.into(), deadline_rx.recv())
            .await
        {
            Err(_) => return,   // Timed out
            Ok(None) => return, // Done
            Ok(Some(d)) => deadline = d,
        }
    }
}

fn truncated(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((ix, _)) => &s[..ix],
        None => s,
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn copy_with_dot_stuffing_sync(
        stuffed: &[u8],
        buffer_size: usize,
    ) -> (DataEnd, Vec<u8>) {
        let mut decoded = Vec::<u8>::new();
        let mut reader =
            tokio::io::BufReader::with_capacity(buffer_size, stuffed);
        let (end, _stats) =
            futures::executor::block_on(copy_with_dot_stuffing(
                &mut decoded,
                &mut reader,
                16 * 1024,
            ))
            .unwrap();
        (end, decoded)
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 4096,
            ..ProptestConfig::default()
        })]

        #[test]
        fn dot_stuffing_decodes_properly(
            content in "(?:x|\\.|\r\n){0,100}\r\n",
            buffer_size in 1usize..=32,
        ) {
            let mut stuffed = content.replace("\r\n.", "\r\n..");
            if stuffed.starts_with('.') {
                stuffed = format!(".{}", stuffed);
            }
            stuffed.push_str(".\r\n");

            let (end, decoded) = copy_with_dot_stuffing_sync(
                stuffed.as_bytes(),
                buffer_size,
            );
            prop_assert_eq!(DataEnd::Done, end);
            prop_assert_eq!(content.as_bytes(), &decoded[..]);
        }
    }

    #[test]
    fn dot_stuffing_bare_lf_detected() {
        let (end, _) =
            copy_with_dot_stuffing_sync(b"foo\nbar\r\n.\r\n", 64);
        assert_eq!(DataEnd::BareLf, end);

        // A UNIX-style end marker is no better.
        let (end, _) =
            copy_with_dot_stuffing_sync(b"ok line\r\n.\n.\r\n", 64);
        assert_eq!(DataEnd::BareLf, end);
    }

    #[test]
    fn dot_stuffing_header_stats() {
        let mut decoded = Vec::new();
        let mut reader = tokio::io::BufReader::new(
            &b"A: 1\r\nB: 2\r\n\r\nbody\r\n.\r\n"[..],
        );
        let (end, stats) =
            futures::executor::block_on(copy_with_dot_stuffing(
                &mut decoded,
                &mut reader,
                16 * 1024,
            ))
            .unwrap();
        assert_eq!(DataEnd::Done, end);
        assert!(stats.hdr_end);
        assert_eq!(12, stats.hdr_size);
        assert_eq!(
            &b"A: 1\r\nB: 2\r\n\r\nbody\r\n"[..],
            &decoded[..],
        );
    }

    #[test]
    fn protocol_names() {
        assert_eq!("SMTP", protocol_name(false, false, false));
        assert_eq!("ESMTP", protocol_name(false, true, false));
        assert_eq!("ESMTPS", protocol_name(false, true, true));
        assert_eq!("SMTPS", protocol_name(false, false, true));
        assert_eq!("UTF8SMTP", protocol_name(true, true, false));
        assert_eq!("UTF8SMTPS", protocol_name(true, true, true));
    }

    #[test]
    fn address_literals() {
        assert_eq!(
            "[192.0.2.3]",
            address_literal_of("192.0.2.3".parse().unwrap()),
        );
        assert_eq!(
            "[IPv6:::1]",
            address_literal_of("::1".parse().unwrap()),
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!("abc", truncated("abc", 64));
        assert_eq!("ab", truncated("abcd", 2));
        assert_eq!("äö", truncated("äöü", 2));
    }
}
