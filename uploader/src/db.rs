//! This module provides the image metadata store: a single SQLite table keyed by canonical file name, plus the
//! one-time repairs applied to data written by older versions of the tool.

use {
    anyhow::{anyhow, Error, Result},
    chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc},
    futures::FutureExt,
    sqlx::{sqlite::SqliteRow, Connection, Row, SqliteConnection},
    std::convert::TryFrom,
    tracing::{info, warn},
    walls_shared::{words, ImageRecord},
};

const COLUMNS: &str = "filename, date_added, last_modified, width, height, pixel_density, file_format, colors, \
                       words, processed_at";

/// Name under which the color column rewrite is recorded in the `migrations` table
const LEGACY_COLORS_MIGRATION: &str = "legacy_color_columns";

/// Name under which the first word list cleanup is recorded in the `migrations` table
const CLEAN_WORDS_MIGRATION: &str = "clean_words";

/// Format a timestamp for storage.
///
/// Fixed nanosecond precision keeps the text lossless and makes lexicographic order match chronological order.
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc))
}

fn encode_list(list: &[String]) -> Result<String> {
    Ok(serde_json::to_string(list)?)
}

/// Decode a list column, treating NULL (i.e. a bare record) as an empty list.
fn decode_list(text: Option<&str>) -> Result<Vec<String>> {
    match text {
        Some(text) if !text.is_empty() => Ok(serde_json::from_str::<Option<Vec<String>>>(text)?.unwrap_or_default()),
        _ => Ok(Vec::new()),
    }
}

fn dimension(value: Option<i64>) -> Result<u32> {
    value
        .map(u32::try_from)
        .transpose()
        .map_err(|e| anyhow!("dimension out of range: {}", e))
        .map(Option::unwrap_or_default)
}

fn record(row: &SqliteRow) -> Result<ImageRecord> {
    Ok(ImageRecord {
        filename: row.try_get("filename")?,
        date_added: parse_time(row.try_get("date_added")?)?,
        last_modified: parse_time(row.try_get("last_modified")?)?,
        width: dimension(row.try_get("width")?)?,
        height: dimension(row.try_get("height")?)?,
        pixel_density: row.try_get::<Option<f64>, _>("pixel_density")?.unwrap_or_default(),
        file_format: row.try_get::<Option<String>, _>("file_format")?.unwrap_or_default(),
        colors: decode_list(row.try_get("colors")?)?,
        words: decode_list(row.try_get("words")?)?,
        processed_at: row
            .try_get::<Option<&str>, _>("processed_at")?
            .map(parse_time)
            .transpose()?,
    })
}

/// Insert `image`, or update every field but `filename` and `date_added` if a record with that name already exists.
///
/// This is a single statement, so a record is never left with enriched fields but a stale `processed_at` or vice
/// versa.
pub async fn upsert_image(conn: &mut SqliteConnection, image: &ImageRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO images (filename, date_added, last_modified, width, height, pixel_density, file_format, \
                             colors, words, processed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(filename) DO UPDATE SET \
           last_modified = excluded.last_modified, \
           width = excluded.width, \
           height = excluded.height, \
           pixel_density = excluded.pixel_density, \
           file_format = excluded.file_format, \
           colors = excluded.colors, \
           words = excluded.words, \
           processed_at = excluded.processed_at",
    )
    .bind(&image.filename)
    .bind(format_time(&image.date_added))
    .bind(format_time(&image.last_modified))
    .bind(i64::from(image.width))
    .bind(i64::from(image.height))
    .bind(image.pixel_density)
    .bind(&image.file_format)
    .bind(encode_list(&image.colors)?)
    .bind(encode_list(&image.words)?)
    .bind(image.processed_at.as_ref().map(format_time))
    .execute(conn)
    .await?;

    Ok(())
}

/// Retrieve the record for `filename`, if any.
pub async fn image(conn: &mut SqliteConnection, filename: &str) -> Result<Option<ImageRecord>> {
    sqlx::query(&format!("SELECT {} FROM images WHERE filename = ?1", COLUMNS))
        .bind(filename)
        .fetch_optional(conn)
        .await?
        .as_ref()
        .map(record)
        .transpose()
}

/// Return whether a record exists for `filename` and has been analyzed at least once.
pub async fn is_processed(conn: &mut SqliteConnection, filename: &str) -> Result<bool> {
    Ok(
        sqlx::query("SELECT 1 FROM images WHERE filename = ?1 AND processed_at IS NOT NULL")
            .bind(filename)
            .fetch_optional(conn)
            .await?
            .is_some(),
    )
}

/// Retrieve every record, most recently added first.
pub async fn all_images(conn: &mut SqliteConnection) -> Result<Vec<ImageRecord>> {
    sqlx::query(&format!(
        "SELECT {} FROM images ORDER BY date_added DESC, filename",
        COLUMNS
    ))
    .fetch_all(conn)
    .await?
    .iter()
    .map(record)
    .collect()
}

/// Escape `query` for use inside a `LIKE ... ESCAPE '\'` pattern.
fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);

    pattern.push('%');

    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }

    pattern.push('%');

    pattern
}

/// Retrieve every record with a word or color, or whose file name, file format, or "{width}x{height}" resolution,
/// contains `query`, ignoring case, most recently added first.
///
/// Words and colors are matched one list element at a time, never against the stored list text.
///
/// An empty query matches everything.
pub async fn search(conn: &mut SqliteConnection, query: &str) -> Result<Vec<ImageRecord>> {
    let query = query.trim().to_lowercase();

    if query.is_empty() {
        return all_images(conn).await;
    }

    sqlx::query(&format!(
        r"SELECT {} FROM images
          WHERE EXISTS (SELECT 1 FROM json_each(images.words) WHERE LOWER(value) LIKE ?1 ESCAPE '\')
             OR EXISTS (SELECT 1 FROM json_each(images.colors) WHERE LOWER(value) LIKE ?1 ESCAPE '\')
             OR LOWER(filename) LIKE ?1 ESCAPE '\'
             OR LOWER(file_format) LIKE ?1 ESCAPE '\'
             OR (width || 'x' || height) LIKE ?1 ESCAPE '\'
          ORDER BY date_added DESC, filename",
        COLUMNS
    ))
    .bind(like_pattern(&query))
    .fetch_all(conn)
    .await?
    .iter()
    .map(record)
    .collect()
}

pub async fn delete_image(conn: &mut SqliteConnection, filename: &str) -> Result<()> {
    sqlx::query("DELETE FROM images WHERE filename = ?1")
        .bind(filename)
        .execute(conn)
        .await?;

    Ok(())
}

/// Make sure a record exists for `filename`.
///
/// If none exists, a bare record is inserted.  If an unprocessed record exists, its modification time is refreshed.
/// A processed record is left alone entirely.
pub async fn ensure_image(
    conn: &mut SqliteConnection,
    filename: &str,
    created: &DateTime<Utc>,
    updated: &DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO images (filename, date_added, last_modified) VALUES (?1, ?2, ?3) \
         ON CONFLICT(filename) DO UPDATE SET last_modified = excluded.last_modified \
         WHERE images.processed_at IS NULL",
    )
    .bind(filename)
    .bind(format_time(created))
    .bind(format_time(updated))
    .execute(conn)
    .await?;

    Ok(())
}

/// Re-apply the word filter to every stored word list, rewriting the records whose lists change.
///
/// Returns the number of records rewritten.  Once everything is clean, this does nothing.
pub async fn clean_words(conn: &mut SqliteConnection) -> Result<usize> {
    conn.transaction(|conn| {
        async move {
            let stored = sqlx::query("SELECT filename, words FROM images WHERE words IS NOT NULL")
                .fetch_all(&mut *conn)
                .await?
                .iter()
                .map(|row| Ok((row.try_get::<String, _>(0)?, decode_list(row.try_get(1)?)?)))
                .collect::<Result<Vec<_>>>()?;

            let mut count = 0;

            for (filename, stored) in stored {
                let clean = words::filter_words(&stored);

                if clean != stored {
                    info!(
                        "cleaning words for {} ({} -> {})",
                        filename,
                        stored.len(),
                        clean.len()
                    );

                    sqlx::query("UPDATE images SET words = ?1 WHERE filename = ?2")
                        .bind(encode_list(&clean)?)
                        .bind(filename)
                        .execute(&mut *conn)
                        .await?;

                    count += 1;
                }
            }

            Ok::<_, Error>(count)
        }
        .boxed()
    })
    .await
}

/// Parse a timestamp as written by older versions of the tool, which did not always use RFC 3339.
fn parse_legacy_time(text: &str) -> Option<DateTime<Utc>> {
    parse_time(text)
        .ok()
        .or_else(|| {
            [
                "%Y-%m-%d %H:%M:%S%.f%:z",
                "%Y-%m-%d %H:%M:%S%.f %z",
                "%Y-%m-%dT%H:%M:%S%.f%:z",
            ]
            .iter()
            .find_map(|format| DateTime::parse_from_str(text, format).ok())
            .map(|time| time.with_timezone(&Utc))
        })
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|time| Utc.from_utc_datetime(&time))
        })
        // Year-one timestamps are what the old schema stored for "never".
        .filter(|time| time.timestamp() > 0)
}

fn legacy_record(row: &SqliteRow) -> Result<ImageRecord> {
    let time = |column: &str| -> Result<Option<DateTime<Utc>>> {
        Ok(row
            .try_get_unchecked::<Option<String>, _>(column)?
            .as_deref()
            .and_then(parse_legacy_time))
    };

    let filename = row.try_get_unchecked::<String, _>("filename")?;
    let last_modified = time("last_modified")?;
    let date_added = time("date_added")?.or(last_modified).unwrap_or_else(|| {
        warn!("no usable timestamps for legacy record {}", filename);
        Utc::now()
    });

    let colors = ["color1", "color2", "color3"]
        .iter()
        .map(|column| row.try_get_unchecked::<Option<String>, _>(*column))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .filter(|color| !color.is_empty())
        .collect();

    Ok(ImageRecord {
        date_added,
        last_modified: last_modified.unwrap_or(date_added),
        width: dimension(row.try_get_unchecked("width")?)?,
        height: dimension(row.try_get_unchecked("height")?)?,
        pixel_density: row
            .try_get_unchecked::<Option<f64>, _>("pixel_density")?
            .unwrap_or_default(),
        file_format: row
            .try_get_unchecked::<Option<String>, _>("file_format")?
            .unwrap_or_default(),
        colors,
        words: decode_list(row.try_get_unchecked::<Option<String>, _>("words")?.as_deref())?,
        processed_at: time("processed_at")?,
        filename,
    })
}

/// Rewrite an `images` table using the historical three-color-column layout into the current layout.
///
/// Returns the number of records carried over, or `None` if the table already uses the current layout.
async fn migrate_legacy_colors(conn: &mut SqliteConnection) -> Result<Option<usize>> {
    let legacy = sqlx::query("PRAGMA table_info(images)")
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .any(|name| name == schema::LEGACY_COLOR_COLUMN);

    if !legacy {
        return Ok(None);
    }

    conn.transaction(|conn| {
        async move {
            let records = sqlx::query("SELECT * FROM images")
                .fetch_all(&mut *conn)
                .await?
                .iter()
                .map(legacy_record)
                .collect::<Result<Vec<_>>>()?;

            sqlx::query("DROP INDEX IF EXISTS images_date_added")
                .execute(&mut *conn)
                .await?;

            sqlx::query("ALTER TABLE images RENAME TO legacy_images")
                .execute(&mut *conn)
                .await?;

            for statement in schema::DDL_STATEMENTS {
                sqlx::query(statement).execute(&mut *conn).await?;
            }

            for image in &records {
                upsert_image(&mut *conn, image).await?;
            }

            sqlx::query("DROP TABLE legacy_images")
                .execute(&mut *conn)
                .await?;

            Ok::<_, Error>(Some(records.len()))
        }
        .boxed()
    })
    .await
}

async fn applied(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    Ok(sqlx::query("SELECT 1 FROM migrations WHERE name = ?1")
        .bind(name)
        .fetch_optional(conn)
        .await?
        .is_some())
}

async fn record_migration(conn: &mut SqliteConnection, name: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO migrations (name, applied) VALUES (?1, ?2)")
        .bind(name)
        .bind(format_time(&Utc::now()))
        .execute(conn)
        .await?;

    Ok(())
}

/// Apply any one-time data repairs which have not yet been applied to this database.
///
/// This is safe to call every time the database is opened.
pub async fn run_migrations(conn: &mut SqliteConnection) -> Result<()> {
    if !applied(conn, LEGACY_COLORS_MIGRATION).await? {
        if let Some(count) = migrate_legacy_colors(conn).await? {
            info!("migrated {} records from the legacy color columns", count);
        }

        record_migration(conn, LEGACY_COLORS_MIGRATION).await?;
    }

    if !applied(conn, CLEAN_WORDS_MIGRATION).await? {
        let count = clean_words(conn).await?;

        info!("cleaned word lists of {} records", count);

        record_migration(conn, CLEAN_WORDS_MIGRATION).await?;
    }

    Ok(())
}
