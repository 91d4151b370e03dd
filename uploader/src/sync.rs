use {
    crate::{
        analysis::ImageAnalyzer,
        db,
        remote::{ObjectStore, RemoteObject},
    },
    anyhow::{anyhow, Context, Result},
    chrono::{DateTime, Duration, Utc},
    futures::{future::BoxFuture, FutureExt},
    rand::{rngs::OsRng, RngCore},
    sqlx::SqliteConnection,
    std::{
        collections::HashSet,
        fmt,
        fs::Metadata,
        path::{Path, PathBuf},
        time::{Instant, SystemTime},
    },
    tokio::fs,
    tracing::{info, warn},
    walls_shared::{self as shared, ImageRecord},
};

/// A random byte below this value triggers a refresh, i.e. roughly one file in ten.
const REFRESH_THRESHOLD: u8 = 26;

/// Longest staleness accepted by [RefreshPolicy::older_than_days]
const MAX_REFRESH_DAYS: i64 = 36_500;

/// Decides whether an already-processed image is analyzed again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Refresh a random ~10% sample of images on each run.
    Sample,
    Never,
    Always,
    /// Refresh images last processed longer ago than this.
    OlderThan(Duration),
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::Sample
    }
}

impl RefreshPolicy {
    /// Refresh images last processed more than `days` days ago, for `days` in `0..=36500`.
    pub fn older_than_days(days: i64) -> Result<Self> {
        if (0..=MAX_REFRESH_DAYS).contains(&days) {
            Ok(Self::OlderThan(Duration::days(days)))
        } else {
            Err(anyhow!(
                "refresh age must be between 0 and {} days, got {}",
                MAX_REFRESH_DAYS,
                days
            ))
        }
    }

    fn fires(&self, image: &ImageRecord, now: DateTime<Utc>) -> bool {
        match self {
            Self::Sample => {
                let mut byte = [0u8; 1];

                match OsRng.try_fill_bytes(&mut byte) {
                    Ok(()) => byte[0] < REFRESH_THRESHOLD,
                    Err(e) => {
                        warn!("unable to sample random refresh: {:?}", e);
                        false
                    }
                }
            }
            Self::Never => false,
            Self::Always => true,
            Self::OlderThan(age) => image
                .processed_at
                .map(|processed| now - processed > *age)
                .unwrap_or(true),
        }
    }
}

/// Tally of what a [sync] run did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub files: usize,
    pub renamed: usize,
    pub uploaded: usize,
    pub unchanged: usize,
    pub analyzed: usize,
    pub analysis_failures: usize,
    pub failures: usize,
    pub deleted: usize,
}

impl fmt::Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "files {}; renamed {}; uploaded {}; unchanged {}; analyzed {}; analysis failures {}; failed {}; \
             deleted {}",
            self.files,
            self.renamed,
            self.uploaded,
            self.unchanged,
            self.analyzed,
            self.analysis_failures,
            self.failures,
            self.deleted
        )
    }
}

/// File creation time, or the modification time where the platform or filesystem doesn't record one
fn created(metadata: &Metadata) -> Result<SystemTime> {
    if cfg!(any(target_os = "macos", target_os = "ios", target_os = "freebsd", windows)) {
        if let Ok(created) = metadata.created() {
            return Ok(created);
        }
    }

    Ok(metadata.modified()?)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn find_files<'a>(dir: &'a Path, result: &'a mut Vec<PathBuf>) -> BoxFuture<'a, Result<()>> {
    async move {
        let mut entries = fs::read_dir(dir)
            .await
            .with_context(|| format!("unable to read {}", dir.to_string_lossy()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            if is_hidden(&path) {
                continue;
            }

            if path.is_file() {
                result.push(path);
            } else if path.is_dir() {
                info!("found directory {}", path.to_string_lossy());

                find_files(&path, result).await?;
            }
        }

        Ok(())
    }
    .boxed()
}

#[cfg(unix)]
async fn same_file(a: &Path, b: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let (a, b) = (fs::metadata(a).await?, fs::metadata(b).await?);

    Ok((a.dev(), a.ino()) == (b.dev(), b.ino()))
}

#[cfg(not(unix))]
async fn same_file(a: &Path, b: &Path) -> Result<bool> {
    Ok(fs::canonicalize(a).await? == fs::canonicalize(b).await?)
}

/// Rename `path` so its file name is `name`, returning the new path.
///
/// Fails rather than replace a different file already named `name`.  On case-insensitive filesystems, a case-only
/// rename finds `path` itself under the new name, which is allowed.
async fn rename(path: &Path, name: &str) -> Result<PathBuf> {
    let new_path = path.with_file_name(name);

    if fs::metadata(&new_path).await.is_ok() && !same_file(path, &new_path).await? {
        return Err(anyhow!(
            "refusing to rename {} over existing file {}",
            path.to_string_lossy(),
            new_path.to_string_lossy()
        ));
    }

    fs::rename(path, &new_path).await?;

    info!("renamed {} to {}", path.to_string_lossy(), name);

    Ok(new_path)
}

async fn sync_file<S: ObjectStore, A: ImageAnalyzer>(
    conn: &mut SqliteConnection,
    store: &S,
    analyzer: &A,
    refresh: &RefreshPolicy,
    path: &Path,
    seen: &mut HashSet<String>,
    stats: &mut SyncStats,
) -> Result<()> {
    let original = path
        .file_name()
        .ok_or_else(|| anyhow!("no file name in {}", path.to_string_lossy()))?
        .to_string_lossy()
        .into_owned();

    let name = shared::format_name(&original);

    // Marked before anything can fail, so a file which fails to upload is never deleted remotely.
    seen.insert(name.clone());

    let path = if name == original {
        path.to_owned()
    } else {
        let new_path = rename(path, &name).await?;
        stats.renamed += 1;
        new_path
    };

    let content = fs::read(&path).await?;
    let metadata = fs::metadata(&path).await?;

    let checksum = shared::checksum(&content);

    if store.checksum(&name).await? == Some(checksum) {
        info!("{} unchanged, skipping upload", name);
        stats.unchanged += 1;
    } else {
        store.upload(&name, &content).await?;
        info!("uploaded {} ({} bytes)", name, content.len());
        stats.uploaded += 1;
    }

    let created = DateTime::<Utc>::from(created(&metadata)?);
    let modified = DateTime::<Utc>::from(metadata.modified()?);

    db::ensure_image(conn, &name, &created, &modified).await?;

    let existing = db::image(conn, &name).await?;
    let now = Utc::now();

    let reason = match &existing {
        None => Some("no metadata"),
        Some(image) if !image.is_processed() => Some("not processed"),
        Some(image) if image.words.is_empty() => Some("no words"),
        Some(image) if refresh.fires(image, now) => Some("refresh"),
        Some(_) => None,
    };

    let reason = match reason {
        Some(reason) => reason,
        None => {
            info!("{} already processed, skipping analysis", name);
            return Ok(());
        }
    };

    info!("analyzing {} ({})", name, reason);

    let format = shared::file_format(&name);

    match analyzer.analyze(&content, &format).await {
        Ok(analysis) => {
            db::upsert_image(
                conn,
                &ImageRecord {
                    filename: name.clone(),
                    date_added: existing.map(|image| image.date_added).unwrap_or(created),
                    last_modified: modified,
                    width: analysis.width,
                    height: analysis.height,
                    pixel_density: analysis.pixel_density,
                    file_format: analysis.file_format,
                    colors: analysis.colors,
                    words: analysis.words,
                    processed_at: Some(Utc::now()),
                },
            )
            .await?;

            stats.analyzed += 1;
        }

        Err(e) => {
            warn!("unable to analyze {}: {:?}", name, e);
            stats.analysis_failures += 1;
        }
    }

    Ok(())
}

/// Upload, rename, and analyze every file under `image_dir`, returning the canonical names of all files found.
async fn sync_local<S: ObjectStore, A: ImageAnalyzer>(
    conn: &mut SqliteConnection,
    store: &S,
    analyzer: &A,
    image_dir: &Path,
    refresh: &RefreshPolicy,
    stats: &mut SyncStats,
) -> Result<HashSet<String>> {
    let mut files = Vec::new();

    find_files(image_dir, &mut files).await?;

    files.sort();

    let mut seen = HashSet::new();

    let count = files.len();

    for (index, path) in files.iter().enumerate() {
        info!("({} of {}) {}", index + 1, count, path.to_string_lossy());

        stats.files += 1;

        if let Err(e) = sync_file(conn, store, analyzer, refresh, path, &mut seen, stats).await {
            warn!("error syncing {}: {:?}", path.to_string_lossy(), e);
            stats.failures += 1;
        }
    }

    Ok(seen)
}

/// Delete every object in `remote` with no local counterpart in `seen`, along with its metadata.
async fn delete_missing<S: ObjectStore>(
    conn: &mut SqliteConnection,
    store: &S,
    remote: &[RemoteObject],
    seen: &HashSet<String>,
    stats: &mut SyncStats,
) -> Result<()> {
    for object in remote {
        // Some keys were historically written with '+' standing in for spaces.
        if seen.contains(&object.key.replace('+', " ")) {
            continue;
        }

        store
            .delete(&object.key)
            .await
            .with_context(|| format!("unable to delete {}", object.key))?;

        info!("deleted {}", object.key);

        stats.deleted += 1;

        if let Err(e) = db::delete_image(conn, &object.key).await {
            warn!("unable to delete metadata for {}: {:?}", object.key, e);
        }
    }

    Ok(())
}

/// Make the remote store and metadata mirror the images under `image_dir`.
///
/// Per-file failures are logged and counted, leaving the remote object and metadata for that file as they were, so
/// that the next run can retry.  Failing to list the remote store, read the local directory tree, or delete a remote
/// object aborts the run.
pub async fn sync<S: ObjectStore, A: ImageAnalyzer>(
    conn: &mut SqliteConnection,
    store: &S,
    analyzer: &A,
    image_dir: &Path,
    refresh: &RefreshPolicy,
) -> Result<SyncStats> {
    info!("starting sync");

    let then = Instant::now();

    let mut remote = store.list().await.context("unable to list remote objects")?;

    remote.sort_by(|a, b| b.created.cmp(&a.created));

    let mut stats = SyncStats::default();

    let seen = sync_local(conn, store, analyzer, image_dir, refresh, &mut stats).await?;

    delete_missing(conn, store, &remote, &seen, &mut stats).await?;

    info!("sync took {:?} ({})", then.elapsed(), stats);

    Ok(stats)
}

#[cfg(test)]
mod test {
    use super::*;

    fn processed_at(time: &str) -> Result<ImageRecord> {
        let now = "2022-06-01T00:00:00Z".parse()?;
        let mut image = ImageRecord::bare("a.jpg", now, now);

        image.processed_at = Some(time.parse()?);

        Ok(image)
    }

    #[test]
    fn refresh_policies() -> Result<()> {
        let now = "2022-06-01T00:00:00Z".parse()?;
        let image = processed_at("2022-05-01T00:00:00Z")?;

        assert!(!RefreshPolicy::Never.fires(&image, now));
        assert!(RefreshPolicy::Always.fires(&image, now));
        assert!(RefreshPolicy::OlderThan(Duration::days(7)).fires(&image, now));
        assert!(!RefreshPolicy::OlderThan(Duration::days(90)).fires(&image, now));

        assert_eq!(
            RefreshPolicy::older_than_days(30)?,
            RefreshPolicy::OlderThan(Duration::days(30))
        );
        assert_eq!(
            RefreshPolicy::older_than_days(0)?,
            RefreshPolicy::OlderThan(Duration::zero())
        );
        assert!(RefreshPolicy::older_than_days(-1).is_err());
        assert!(RefreshPolicy::older_than_days(MAX_REFRESH_DAYS + 1).is_err());
        assert!(RefreshPolicy::older_than_days(999_999_999_999_999).is_err());

        let sampled = (0..1000)
            .filter(|_| RefreshPolicy::Sample.fires(&image, now))
            .count();

        // Expected ~102, with a standard deviation under 10
        assert!((40..200).contains(&sampled), "sampled {}", sampled);

        Ok(())
    }

    #[test]
    fn creation_time() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let metadata = std::fs::metadata(file.path())?;

        assert!(created(&metadata)? <= metadata.modified()?);
        assert!(created(&metadata)? <= SystemTime::now());

        Ok(())
    }

    #[tokio::test]
    async fn rename_guard() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let upper = dir.path().join("Sunset.png");
        let lower = dir.path().join("sunset.png");

        fs::write(&upper, b"red").await?;

        assert!(same_file(&upper, &upper).await?);

        fs::write(&lower, b"blue").await?;

        // Case-insensitive filesystems can't hold both names at once.
        if fs::read(&upper).await? == b"blue" {
            return Ok(());
        }

        assert!(!same_file(&upper, &lower).await?);
        assert!(rename(&upper, "sunset.png").await.is_err());
        assert_eq!(fs::read(&lower).await?, b"blue");
        assert_eq!(fs::read(&upper).await?, b"red");

        let other = rename(&upper, "other.png").await?;

        assert_eq!(other, dir.path().join("other.png"));
        assert_eq!(fs::read(&other).await?, b"red");

        Ok(())
    }

    #[test]
    fn hidden() {
        assert!(is_hidden(Path::new("/images/.DS_Store")));
        assert!(is_hidden(Path::new(".git")));
        assert!(!is_hidden(Path::new("/images/.cache/sunset.jpg")));
        assert!(!is_hidden(Path::new("sunset.jpg")));
    }
}
