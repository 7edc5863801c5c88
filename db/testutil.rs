// This file is part of StreamVault, a live-stream recording supervisor.

//! Test-only helpers for building a throwaway, fully-initialized database.

use crate::db::Database;
use rusqlite::Connection;

/// Opens an in-memory database with the schema already applied, wrapped in a
/// `Database` generic over whatever clock type the caller's tests use.
pub fn open_test_db<C>() -> Database<C> {
    let mut conn = Connection::open_in_memory().unwrap();
    crate::db::init(&mut conn).unwrap();
    Database::new(conn).unwrap()
}
