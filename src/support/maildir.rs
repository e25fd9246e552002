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

//! Writing one message into a Maildir.
//!
//! The incoming message is staged in `tmp/` and renamed into `new/` on
//! `save()`; readers never observe a partial file. Unique names follow
//! <https://cr.yp.to/proto/maildir.html>: `<epoch-sec>.R<random>.<host>`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use log::{error, warn};
use rand::RngCore;

pub struct Message {
    tmpfn: PathBuf,
    newfn: PathBuf,
    file: Option<fs::File>,
    id: String,
    when: DateTime<Utc>,
    size: u64,
    max_size: u64,
    size_error: bool,
    /// The first write failure, latched so `save()` can re-report it even
    /// though the caller keeps consuming the client's bytes.
    io_error: Option<(io::ErrorKind, Option<i32>)>,
}

impl Message {
    /// Creates the staging file for one message.
    ///
    /// `folder` is `""` for the INBOX or a dotted sub-folder such as
    /// `".Junk"`. Missing `tmp/` and `new/` directories are created.
    pub fn open(
        maildir: &Path,
        fqdn: &str,
        max_size: u64,
        folder: &str,
    ) -> io::Result<Self> {
        let mut dir = maildir.to_owned();
        if !folder.is_empty() {
            dir.push(folder);
        }

        let tmpdir = dir.join("tmp");
        let newdir = dir.join("new");
        fs::create_dir_all(&tmpdir)?;
        fs::create_dir_all(&newdir)?;

        let when = Utc::now();
        let id = format!(
            "{}.R{:016x}.{}",
            when.timestamp(),
            rand::thread_rng().next_u64(),
            fqdn,
        );

        let tmpfn = tmpdir.join(&id);
        let newfn = newdir.join(&id);

        let file = {
            use std::os::unix::fs::OpenOptionsExt as _;
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&tmpfn)?
        };

        Ok(Self {
            tmpfn,
            newfn,
            file: Some(file),
            id,
            when,
            size: 0,
            max_size,
            size_error: false,
            io_error: None,
        })
    }

    /// The unique name, also used as the message id in the Received header.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the message was opened; this is the date stamped into the
    /// Received header.
    pub fn when(&self) -> DateTime<Utc> {
        self.when
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn size_error(&self) -> bool {
        self.size_error
    }

    /// Appends `buf` unless the size limit has been hit or an earlier
    /// write failed.
    ///
    /// Both failure modes latch: further writes are silently discarded so
    /// the caller can keep consuming the client's bytes to keep the stream
    /// aligned, then learn the outcome from `size_error()` or `save()`.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.size_error || self.io_error.is_some() {
            return Ok(());
        }

        if self.size + buf.len() as u64 > self.max_size {
            self.size_error = true;
            return Ok(());
        }

        self.size += buf.len() as u64;
        let result = self
            .file
            .as_mut()
            .expect("write after save/trash")
            .write_all(buf);
        if let Err(ref e) = result {
            self.io_error = Some((e.kind(), e.raw_os_error()));
        }
        result
    }

    /// Moves the staged file into `new/`, making it visible to readers.
    ///
    /// A write failure latched earlier is re-reported here instead, and
    /// the staging file is removed.
    pub fn save(mut self) -> io::Result<()> {
        if let Some((kind, raw)) = self.io_error {
            self.close_();
            let _ = fs::remove_file(&self.tmpfn);
            return Err(match raw {
                Some(code) => io::Error::from_raw_os_error(code),
                None => io::Error::from(kind),
            });
        }

        if self.size_error {
            warn!(
                "message size error: {} exceeds {}",
                self.size, self.max_size,
            );
        }

        self.close_();
        let renamed = fs::rename(&self.tmpfn, &self.newfn);
        if renamed.is_err() {
            let _ = fs::remove_file(&self.tmpfn);
        }
        renamed
    }

    /// Deletes the staged file.
    pub fn trash(mut self) {
        self.close_();
        if let Err(e) = fs::remove_file(&self.tmpfn) {
            error!("can't remove {}: {}", self.tmpfn.display(), e);
        }
    }

    fn close_(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                error!("can't sync {}: {}", self.tmpfn.display(), e);
            }
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        // An abandoned message (connection died mid-DATA) must not leave its
        // staging file behind.
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmpfn);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn save_moves_to_new() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut msg =
            Message::open(dir.path(), "mx.example.com", 1024, "").unwrap();
        msg.write(b"Subject: hi\r\n\r\nbody\r\n").unwrap();
        assert_eq!(22, msg.size());
        assert!(!msg.size_error());
        let id = msg.id().to_owned();
        msg.save().unwrap();

        let delivered = dir.path().join("new").join(&id);
        assert_eq!(
            "Subject: hi\r\n\r\nbody\r\n",
            fs::read_to_string(delivered).unwrap(),
        );
        assert!(fs::read_dir(dir.path().join("tmp")).unwrap().next().is_none());
    }

    #[test]
    fn trash_removes_staging() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut msg =
            Message::open(dir.path(), "mx.example.com", 1024, "").unwrap();
        msg.write(b"data").unwrap();
        msg.trash();

        assert!(fs::read_dir(dir.path().join("tmp")).unwrap().next().is_none());
        assert!(fs::read_dir(dir.path().join("new")).unwrap().next().is_none());
    }

    #[test]
    fn size_error_latches() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut msg =
            Message::open(dir.path(), "mx.example.com", 8, "").unwrap();
        msg.write(b"12345678").unwrap();
        assert!(!msg.size_error());
        msg.write(b"9").unwrap();
        assert!(msg.size_error());
        // Latches even if a later write would fit.
        msg.write(b"").unwrap();
        assert!(msg.size_error());
        assert_eq!(8, msg.size());
        msg.trash();
    }

    #[test]
    fn junk_folder() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut msg =
            Message::open(dir.path(), "mx.example.com", 1024, ".Junk")
                .unwrap();
        msg.write(b"spam\r\n").unwrap();
        let id = msg.id().to_owned();
        msg.save().unwrap();

        assert!(dir.path().join(".Junk").join("new").join(id).is_file());
    }

    #[test]
    fn drop_cleans_up() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut msg =
                Message::open(dir.path(), "mx.example.com", 1024, "")
                    .unwrap();
            msg.write(b"partial").unwrap();
        }
        assert!(fs::read_dir(dir.path().join("tmp")).unwrap().next().is_none());
    }
}
