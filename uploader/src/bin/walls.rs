use {
    anyhow::Result,
    serde_derive::Serialize,
    std::path::PathBuf,
    structopt::StructOpt,
    walls_shared::{self as shared, ImageRecord},
    walls_uploader::{db, Analyzer, GcsStore, Gemini, RefreshPolicy, DEFAULT_MODEL},
};

#[derive(StructOpt, Debug)]
#[structopt(name = "walls", about = "Wallpaper bucket sync and metadata index")]
enum Command {
    /// Make the bucket and metadata index mirror a local image directory
    Sync {
        /// Directory containing the wallpapers to publish
        #[structopt(long)]
        image_directory: PathBuf,

        /// Google Cloud Storage bucket to publish to
        #[structopt(long, env = "WALLS_BUCKET")]
        bucket: String,

        /// SQLite database to create or reuse
        #[structopt(long, default_value = "wallpapers.db")]
        state_file: String,

        /// OAuth access token for the storage API
        #[structopt(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,

        /// Gemini API key.  Without one, images are indexed without descriptive words.
        #[structopt(long, env = "GEMINI_API_KEY", hide_env_values = true)]
        gemini_api_key: Option<String>,

        /// Gemini model used to describe images
        #[structopt(long, default_value = DEFAULT_MODEL)]
        gemini_model: String,

        /// Re-analyze images last analyzed more than this many days ago, instead of a random sample
        #[structopt(long)]
        refresh_after_days: Option<i64>,

        /// Never re-analyze images which have already been analyzed
        #[structopt(long)]
        no_refresh: bool,
    },

    /// Print the images matching a query as JSON
    Search {
        /// SQLite database to read
        #[structopt(long, default_value = "wallpapers.db")]
        state_file: String,

        /// Text to match against words, colors, file names, formats, and resolutions.  If not specified, all images
        /// are printed.
        query: Option<String>,
    },

    /// Re-apply the word filter to every stored word list
    CleanWords {
        /// SQLite database to create or reuse
        #[structopt(long, default_value = "wallpapers.db")]
        state_file: String,
    },
}

#[derive(Serialize)]
struct SearchResult<'a> {
    #[serde(flatten)]
    image: &'a ImageRecord,
    resolution: String,
    thumbnail: String,
    full_resolution: String,
}

impl<'a> From<&'a ImageRecord> for SearchResult<'a> {
    fn from(image: &'a ImageRecord) -> Self {
        Self {
            resolution: image.resolution(),
            thumbnail: shared::thumbnail_url(&image.filename),
            full_resolution: shared::full_resolution_url(&image.filename),
            image,
        }
    }
}

fn refresh_policy(no_refresh: bool, refresh_after_days: Option<i64>) -> Result<RefreshPolicy> {
    Ok(match (no_refresh, refresh_after_days) {
        (true, _) => RefreshPolicy::Never,
        (false, Some(days)) => RefreshPolicy::older_than_days(days)?,
        (false, None) => RefreshPolicy::Sample,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init_timed();

    match Command::from_args() {
        Command::Sync {
            image_directory,
            bucket,
            state_file,
            access_token,
            gemini_api_key,
            gemini_model,
            refresh_after_days,
            no_refresh,
        } => {
            if gemini_api_key.as_deref().unwrap_or_default().is_empty() {
                tracing::warn!("GEMINI_API_KEY not set; images will be indexed without words");
            }

            let refresh = refresh_policy(no_refresh, refresh_after_days)?;

            let mut conn = walls_uploader::open(&state_file).await?;

            db::run_migrations(&mut conn).await?;

            let store = GcsStore::new(&bucket, &access_token)?;
            let analyzer = Analyzer::new(Gemini::new(gemini_api_key, &gemini_model)?);

            let stats =
                walls_uploader::sync(&mut conn, &store, &analyzer, &image_directory, &refresh).await?;

            println!("{}", stats);
        }

        Command::Search { state_file, query } => {
            let mut conn = walls_uploader::open(&state_file).await?;

            let images = db::search(&mut conn, query.as_deref().unwrap_or_default()).await?;

            println!(
                "{}",
                serde_json::to_string_pretty(&images.iter().map(SearchResult::from).collect::<Vec<_>>())?
            );
        }

        Command::CleanWords { state_file } => {
            let mut conn = walls_uploader::open(&state_file).await?;

            db::run_migrations(&mut conn).await?;

            let count = db::clean_words(&mut conn).await?;

            println!("cleaned {} word lists", count);
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use {super::*, chrono::Duration};

    fn parse(args: &[&str]) -> Result<Command> {
        Ok(Command::from_iter_safe(
            ["walls", "sync", "--image-directory", "images", "--bucket", "walls", "--access-token", "token"]
                .iter()
                .chain(args),
        )?)
    }

    #[test]
    fn sync_options() -> Result<()> {
        match parse(&[])? {
            Command::Sync {
                gemini_model,
                refresh_after_days,
                no_refresh,
                ..
            } => {
                assert_eq!(gemini_model, DEFAULT_MODEL);
                assert_eq!(refresh_policy(no_refresh, refresh_after_days)?, RefreshPolicy::Sample);
            }
            command => panic!("unexpected command: {:?}", command),
        }

        match parse(&["--refresh-after-days", "999999999999999"])? {
            Command::Sync {
                refresh_after_days,
                no_refresh,
                ..
            } => assert!(refresh_policy(no_refresh, refresh_after_days).is_err()),
            command => panic!("unexpected command: {:?}", command),
        }

        assert_eq!(
            refresh_policy(false, Some(7))?,
            RefreshPolicy::OlderThan(Duration::days(7))
        );
        assert!(refresh_policy(false, Some(-7)).is_err());
        assert_eq!(refresh_policy(true, Some(-7))?, RefreshPolicy::Never);

        Ok(())
    }
}
