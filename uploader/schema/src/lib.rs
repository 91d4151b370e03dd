pub static DDL_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS images (
       filename       TEXT NOT NULL PRIMARY KEY,
       date_added     TEXT NOT NULL,
       last_modified  TEXT NOT NULL,
       width          INTEGER,
       height         INTEGER,
       pixel_density  REAL,
       file_format    TEXT,
       colors         TEXT,
       words          TEXT,
       processed_at   TEXT
     )",
    "CREATE INDEX IF NOT EXISTS images_date_added ON images (date_added)",
    "CREATE TABLE IF NOT EXISTS migrations (
       name     TEXT NOT NULL PRIMARY KEY,
       applied  TEXT NOT NULL
     )",
];

/// Name of the column which only exists in the historical layout of the `images` table, where the three dominant
/// colors were kept in `color1`, `color2`, and `color3` instead of a single list.
pub static LEGACY_COLOR_COLUMN: &str = "color1";
