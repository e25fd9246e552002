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

use std::cell::RefCell;
use std::fs;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use log::{error, info, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use structopt::StructOpt;

use crate::smtp::session::{Session, SessionParams};
use crate::support::{
    async_io::ServerIo,
    dns,
    error::Error,
    log_prefix::LogPrefix,
    system_config::{locate_maildir, SystemConfig},
};

// Needs to be a macro and not die! so that errors reach the log before the
// process is gone.
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

/// Smtpin — an Internet-facing SMTP receiver.
///
/// One invocation serves one already-accepted connection over standard IO,
/// in the manner of inetd. Accepted messages land in the Maildir named by
/// $MAILDIR (default $HOME/Maildir); spam lands in its .Junk folder.
#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Serve a single SMTP session over standard IO.
    ///
    /// This is intended to be used with inetd, xinetd, etc. It is the main
    /// way to run Smtpin in production.
    Serve(CommonOptions),
}

#[derive(StructOpt, Default)]
struct CommonOptions {
    /// The directory containing `smtpin.toml`, the policy cdb files, and
    /// `public_suffix_list.dat`
    /// [default: /etc/smtpin or /usr/local/etc/smtpin]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

pub fn main() {
    crate::init_simple_log();

    match Command::from_args() {
        Command::Serve(options) => serve(options),
    }
}

fn system_root(options: &CommonOptions) -> PathBuf {
    if let Some(ref root) = options.root {
        return root.clone();
    }

    for candidate in ["/etc/smtpin", "/usr/local/etc/smtpin"] {
        let candidate = PathBuf::from(candidate);
        if candidate.is_dir() {
            return candidate;
        }
    }

    fatal!(
        EX_CONFIG,
        "No --root given and neither /etc/smtpin nor \
         /usr/local/etc/smtpin exists",
    );
}

fn load_system_config(root: &PathBuf) -> SystemConfig {
    let path = root.join("smtpin.toml");
    let text = fs::read_to_string(&path).unwrap_or_else(|e| {
        fatal!(EX_CONFIG, "Can't read {}: {}", path.display(), e)
    });
    toml::from_str::<SystemConfig>(&text).unwrap_or_else(|e| {
        fatal!(EX_CONFIG, "Can't parse {}: {}", path.display(), e)
    })
}

fn create_ssl_acceptor(
    config: &SystemConfig,
    root: &PathBuf,
) -> SslAcceptor {
    let mut acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
            .unwrap_or_else(|e| {
                fatal!(EX_SOFTWARE, "Can't set up TLS context: {}", e)
            });

    let private_key = root.join(&config.tls.private_key);
    let certificate_chain = root.join(&config.tls.certificate_chain);

    acceptor
        .set_private_key_file(&private_key, SslFiletype::PEM)
        .unwrap_or_else(|e| {
            fatal!(
                EX_CONFIG,
                "Unable to load TLS private key from {}: {}",
                private_key.display(),
                e,
            )
        });
    acceptor
        .set_certificate_chain_file(&certificate_chain)
        .unwrap_or_else(|e| {
            fatal!(
                EX_CONFIG,
                "Unable to load TLS certificate chain from {}: {}",
                certificate_chain.display(),
                e,
            )
        });

    acceptor.build()
}

const STDIN: RawFd = 0;

fn socket_ip<F: FnOnce(RawFd) -> nix::Result<nix::sys::socket::SockaddrStorage>>(
    get: F,
) -> Option<IpAddr> {
    let ss = get(STDIN).ok()?;
    if let Some(sin) = ss.as_sockaddr_in() {
        return Some(IpAddr::V4(sin.ip().into()));
    }
    if let Some(sin6) = ss.as_sockaddr_in6() {
        return Some(IpAddr::V6(sin6.ip()));
    }
    None
}

#[tokio::main(flavor = "current_thread")]
async fn serve(options: CommonOptions) {
    let root = system_root(&options);
    let config = Arc::new(load_system_config(&root));
    let ssl_acceptor = create_ssl_acceptor(&config, &root);

    let maildir = locate_maildir().unwrap_or_else(|| {
        fatal!(
            EX_CONFIG,
            "Neither MAILDIR nor HOME is set; nowhere to deliver",
        )
    });

    let peer_ip = socket_ip(
        nix::sys::socket::getpeername::<nix::sys::socket::SockaddrStorage>,
    );
    let us_ip = socket_ip(
        nix::sys::socket::getsockname::<nix::sys::socket::SockaddrStorage>,
    );

    let log_prefix = LogPrefix::new("smtp".to_owned());

    let io = ServerIo::new_stdio().unwrap_or_else(|e| {
        fatal!(
            EX_OSERR,
            "Failed to put stdio into non-blocking mode: {:?}",
            e,
        )
    });

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let resolver =
                match hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
                {
                    Ok(resolver) => Some(Rc::new(resolver)),
                    Err(e) => {
                        warn!(
                            "Can't set up DNS resolver, continuing \
                             without: {}",
                            e,
                        );
                        None
                    },
                };

            let mut session = Session::new(SessionParams {
                io,
                config,
                lists_dir: root.clone(),
                maildir,
                log_prefix: log_prefix.clone(),
                ssl_acceptor: Some(ssl_acceptor),
                peer_ip,
                us_ip,
                resolver,
                dns_cache: Rc::new(RefCell::new(dns::Cache::default())),
            })
            .unwrap_or_else(|e| fatal!(EX_CONFIG, "{}", e));

            match session.run().await {
                Ok(()) => {
                    info!("{} Normal client disconnect", log_prefix)
                },
                Err(Error::Io(e)) => {
                    warn!(
                        "{} Abnormal client disconnect: {}",
                        log_prefix, e,
                    )
                },
                Err(Error::Ssl(e)) => {
                    warn!("{} TLS failure: {}", log_prefix, e)
                },
                Err(e) => {
                    fatal!(EX_SOFTWARE, "{} {}", log_prefix, e)
                },
            }
        })
        .await;
}
