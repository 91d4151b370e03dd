//! Wallpaper bucket reconciler
//!
//! [sync] makes a remote object store mirror a local directory of images, normalizing file names, uploading only
//! what changed, and keeping a SQLite index of searchable image metadata (see [db]) up to date using an
//! [ImageAnalyzer].

use {
    anyhow::Result,
    sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, SqliteConnection},
};

pub use {
    analysis::{Analysis, Analyzer, ImageAnalyzer, WordExtractor},
    gemini::{Gemini, DEFAULT_MODEL},
    remote::{GcsStore, ObjectStore, RemoteObject, StatusError},
    sync::{sync, RefreshPolicy, SyncStats},
};

pub mod analysis;
pub mod db;
pub mod gemini;
pub mod remote;
pub mod sync;

/// Open the metadata store in `state_file`, creating it and its tables if necessary.
pub async fn open(state_file: &str) -> Result<SqliteConnection> {
    let mut conn = format!("sqlite://{}", state_file)
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true)
        .connect()
        .await?;

    for statement in schema::DDL_STATEMENTS {
        sqlx::query(statement).execute(&mut conn).await?;
    }

    Ok(conn)
}
