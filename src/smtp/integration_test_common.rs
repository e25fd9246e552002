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

use std::io::{self, BufRead, Read, Write};
use std::mem;

use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::ssl::{
    SslAcceptor, SslConnector, SslMethod, SslVerifyMode,
};
use openssl::x509::{X509Builder, X509NameBuilder};

/// Builds an `SslAcceptor` around a freshly generated throw-away
/// self-signed certificate.
pub fn test_ssl_acceptor() -> SslAcceptor {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "localhost").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let certificate = builder.build();

    let mut acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
            .unwrap();
    acceptor.set_private_key(&key).unwrap();
    acceptor.set_certificate(&certificate).unwrap();
    acceptor.build()
}

pub trait ReadWrite: Read + Write {}
impl<T: Read + Write + ?Sized> ReadWrite for T {}

pub struct SmtpClient {
    name: &'static str,
    io: Box<dyn ReadWrite>,
}

impl SmtpClient {
    pub fn new(name: &'static str, io: impl ReadWrite + 'static) -> Self {
        Self {
            name,
            io: Box::new(io),
        }
    }

    /// Read responses from the server up to and including the final
    /// response.
    ///
    /// This creates a `BufReader` over `io` and will lose any data which
    /// was buffered after the last read line. This should be fine since we
    /// don't do pipelining here (the one pipelining test reads exactly the
    /// lines it expects).
    pub fn read_responses(&mut self) -> Vec<String> {
        let mut ret = Vec::<String>::new();
        let mut r = io::BufReader::new(&mut self.io);

        loop {
            let mut line = String::new();
            r.read_line(&mut line).unwrap();
            println!("[{}] >> {:?}", self.name, line);

            if line.is_empty() {
                panic!("Unexpected EOF");
            }

            let last = " " == &line[3..4];
            ret.push(line);

            if last {
                break;
            }
        }

        ret
    }

    /// Reads `n` complete responses with a single buffered reader, for
    /// checking pipelined reply groups without losing buffered lines.
    pub fn read_n_responses(&mut self, n: usize) -> Vec<String> {
        let mut ret = Vec::<String>::new();
        let mut r = io::BufReader::new(&mut self.io);

        for _ in 0..n {
            loop {
                let mut line = String::new();
                r.read_line(&mut line).unwrap();
                println!("[{}] >> {:?}", self.name, line);

                if line.is_empty() {
                    panic!("Unexpected EOF");
                }

                let last = " " == &line[3..4];
                ret.push(line);

                if last {
                    break;
                }
            }
        }

        ret
    }

    /// Asserts that the server has closed the connection.
    pub fn read_eof(&mut self) {
        let mut buf = [0u8; 64];
        match self.io.read(&mut buf) {
            Ok(0) => (),
            // An abrupt TLS teardown (no close_notify) also counts.
            Err(_) => (),
            Ok(nread) => panic!(
                "[{}] expected EOF, got {:?}",
                self.name,
                String::from_utf8_lossy(&buf[..nread]),
            ),
        }
    }

    /// Writes the given complete line to the server.
    pub fn write_line(&mut self, s: &str) {
        assert!(s.ends_with('\n'));
        for line in s.split_inclusive('\n') {
            println!("[{}] << {:?}", self.name, line);
        }
        self.io.write_all(s.as_bytes()).unwrap();
    }

    /// Writes the given raw data to the server.
    pub fn write_raw(&mut self, data: &[u8]) {
        println!("[{}] << [{} bytes]", self.name, data.len());
        self.io.write_all(data).unwrap();
    }

    /// Skip the server greeting, then send the given command and consume
    /// the responses. Assert that the command succeeds.
    pub fn skip_pleasantries(&mut self, cmd: &str) {
        self.read_responses();
        self.write_line(&format!("{}\r\n", cmd));
        let responses = self.read_responses();
        assert!(responses.last().unwrap().starts_with("250"));
    }

    /// Send a command which is expected to have one response with the
    /// given prefix.
    pub fn simple_command(&mut self, command: &str, prefix: &str) {
        self.write_line(&format!("{}\r\n", command));
        let responses = self.read_responses();
        assert_eq!(1, responses.len());
        assert!(
            responses[0].starts_with(prefix),
            "expected {:?}.., got {:?}",
            prefix,
            responses[0],
        );
    }

    /// Performs a TLS handshake on the connection.
    pub fn start_tls(&mut self) {
        let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);

        println!("[{}] <> Start TLS handshake", self.name);
        let cxn = mem::replace(&mut self.io, Box::new(io::empty()));
        let cxn = connector
            .build()
            .connect("localhost", cxn)
            .map_err(|_| "SSL handshake failed")
            .unwrap();
        println!("[{}] <> TLS handshake succeeded", self.name);
        self.io = Box::new(cxn);
    }

    /// Skip the greeting, perform an EHLO, STARTTLS, and the second EHLO.
    pub fn skip_pleasantries_with_tls(&mut self, command: &str) {
        self.skip_pleasantries(command);
        self.simple_command("STARTTLS", "220 2.0.0");
        self.start_tls();
        self.write_line(&format!("{}\r\n", command));
        let responses = self.read_responses();
        assert!(responses.last().unwrap().starts_with("250"));
    }
}
