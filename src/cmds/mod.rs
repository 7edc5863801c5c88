// This file is part of StreamVault, a live-stream recording supervisor.

//! Shared CLI plumbing: single-instance locking and opening of the SQLite
//! index database.
//!
//! Unlike a sample-file directory with its own on-disk metadata, this
//! domain has exactly one SQLite file per `db_dir`. The lock is taken
//! directly on `db_dir` itself — an `O_RDONLY` file descriptor on the
//! directory, flocked exclusively — so two `streamvault` processes can
//! never open the same database file at once.

use base::{Error, ErrorKind, ResultExt};
use nix::fcntl::{flock, FlockArg};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::info;

pub mod init;
pub mod run;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    Create,
}

/// Holds the exclusive flock on `db_dir` for as long as it's alive.
pub struct DirLock(#[allow(dead_code)] File);

fn open_dir(db_dir: &Path, mode: OpenMode) -> Result<DirLock, Error> {
    if mode == OpenMode::Create {
        std::fs::create_dir_all(db_dir).err_kind(ErrorKind::Internal)?;
    }
    let dir = File::open(db_dir).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            base::format_err_t!(
                NotFound,
                "db dir {} not found; try running `streamvault init`",
                db_dir.display()
            )
        } else {
            base::format_err_t!(Internal, "unable to open db dir {}: {}", db_dir.display(), e)
        }
    })?;
    flock(dir.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|e| {
        base::format_err_t!(
            Internal,
            "unable to get exclusive lock on db dir {}: {}",
            db_dir.display(),
            e
        )
    })?;
    Ok(DirLock(dir))
}

/// Locks and opens the database at `<db_dir>/streamvault.db`.
pub fn open_conn(db_dir: &Path, mode: OpenMode) -> Result<(DirLock, rusqlite::Connection), Error> {
    let dir = open_dir(db_dir, mode)?;
    let db_path = db_dir.join("streamvault.db");
    info!(
        path = %db_path.display(),
        sqlite_version = rusqlite::version(),
        "opening database"
    );
    let flags = match mode {
        OpenMode::ReadWrite => rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
        OpenMode::Create => {
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
        }
    } | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn =
        rusqlite::Connection::open_with_flags(&db_path, flags).err_kind(ErrorKind::Internal)?;
    Ok((dir, conn))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_dir_of_nonexistent_path_is_not_found() {
        let tmpdir = tempfile::Builder::new()
            .prefix("streamvault-test")
            .tempdir()
            .unwrap();
        let mut nonexistent = tmpdir.path().to_path_buf();
        nonexistent.push("nonexistent");
        let err = open_dir(&nonexistent, OpenMode::ReadWrite).unwrap_err();
        assert!(
            err.to_string().contains("streamvault init"),
            "unexpected error {err}"
        );
    }

    #[test]
    fn open_dir_with_create_makes_the_directory() {
        let tmpdir = tempfile::Builder::new()
            .prefix("streamvault-test")
            .tempdir()
            .unwrap();
        let mut new_dir = tmpdir.path().to_path_buf();
        new_dir.push("db");
        open_dir(&new_dir, OpenMode::Create).unwrap();
        assert!(new_dir.is_dir());
    }

    #[test]
    fn second_exclusive_lock_on_same_dir_fails() {
        let tmpdir = tempfile::Builder::new()
            .prefix("streamvault-test")
            .tempdir()
            .unwrap();
        let _first = open_dir(tmpdir.path(), OpenMode::ReadWrite).unwrap();
        let second = open_dir(tmpdir.path(), OpenMode::ReadWrite);
        assert!(second.is_err());
    }
}
