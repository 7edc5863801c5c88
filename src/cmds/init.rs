// This file is part of StreamVault, a live-stream recording supervisor.

//! Creates and schema-initializes the SQLite index database.

use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

/// Initializes the SQLite index database.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    /// Directory holding the SQLite3 index database.
    #[bpaf(long("db-dir"), argument("PATH"), fallback("/var/lib/streamvault/db".into()))]
    db_dir: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let (_dir_lock, mut conn) = super::open_conn(&args.db_dir, super::OpenMode::Create)?;

    let cur_ver = db::get_schema_version(&conn)?;
    if let Some(v) = cur_ver {
        info!(schema_version = v, "database is already initialized");
        return Ok(0);
    }

    // Use WAL mode (the most efficient way to preserve database integrity)
    // with a large page size (segment/task rows are small, but fewer pages
    // means fewer seeks under concurrent pipeline workers). Changing page
    // size requires a vacuum outside WAL mode; cheap on an empty database.
    // https://www.sqlite.org/pragma.html#pragma_page_size
    conn.execute_batch(
        r#"
        pragma journal_mode = delete;
        pragma page_size = 16384;
        vacuum;
        pragma journal_mode = wal;
        "#,
    )
    .map_err(|e| base::format_err_t!(Internal, "failed to set up database pragmas: {}", e))?;
    db::init(&mut conn)?;
    info!("database initialized");
    Ok(0)
}
