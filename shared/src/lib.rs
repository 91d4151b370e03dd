//! Wallpaper sync shared code
//!
//! This crate contains the I/O-free pieces of the wallpaper sync pipeline: the canonical naming rule for files,
//! the CRC32C fingerprint used to compare local files against remote objects, the [ImageRecord] metadata type, and
//! the filter applied to descriptive words returned by the image analysis service (see the [words] submodule).

use {
    anyhow::{anyhow, Result},
    chrono::{DateTime, Utc},
    lazy_static::lazy_static,
    regex::Regex,
    serde_derive::{Deserialize, Serialize},
    std::convert::TryInto,
};

pub mod words;

/// Host from which downstream consumers serve resized variants of uploaded objects
pub const IMAGE_HOST: &str = "https://icco-walls.imgix.net";

/// Bounds used for full resolution variants
pub const FULL_RESOLUTION_BOUNDS: (u32, u32) = (3840, 2160);

/// Bounds used for thumbnail variants
pub const THUMBNAIL_BOUNDS: (u32, u32) = (800, 450);

/// Metadata describing one published image
///
/// A record starts out "bare" (just `filename` and the two file timestamps) the first time a file is observed and
/// is enriched in place once analysis succeeds, at which point `processed_at` becomes non-`None`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImageRecord {
    /// Canonical file name, which doubles as the remote object key
    pub filename: String,

    /// When the file was first observed (file creation time where available)
    pub date_added: DateTime<Utc>,

    /// File modification time as of the last sync
    pub last_modified: DateTime<Utc>,

    pub width: u32,

    pub height: u32,

    /// Megapixels, i.e. `width * height / 1e6`
    pub pixel_density: f64,

    /// Short format name (e.g. "jpeg" or "png")
    pub file_format: String,

    /// Up to three dominant colors as `#rrggbb` strings, most prominent first
    pub colors: Vec<String>,

    /// Descriptive and OCR words, in the order the analysis service returned them
    pub words: Vec<String>,

    /// When analysis last completed, or `None` if it never has
    pub processed_at: Option<DateTime<Utc>>,
}

impl ImageRecord {
    /// Create a record which carries only a name and file timestamps.
    pub fn bare(filename: &str, date_added: DateTime<Utc>, last_modified: DateTime<Utc>) -> Self {
        Self {
            filename: filename.to_owned(),
            date_added,
            last_modified,
            width: 0,
            height: 0,
            pixel_density: 0.0,
            file_format: String::new(),
            colors: Vec::new(),
            words: Vec::new(),
            processed_at: None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// The "{width}x{height}" string which searches match against
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Split `name` into its stem and extension (without the dot).
///
/// Unlike `Path::extension`, a leading dot counts, so ".jpg" has extension "jpg" and an empty stem.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(index) => (&name[..index], Some(&name[index + 1..])),
        None => (name, None),
    }
}

/// Canonicalize a file name into a storage-safe key.
///
/// The extension is lower-cased (with "jpeg" mapped to "jpg") and every character outside `[a-z0-9]` is removed
/// from the lower-cased stem.  Any directory components are discarded.  This is idempotent.
pub fn format_name(name: &str) -> String {
    lazy_static! {
        static ref DISALLOWED: Regex = Regex::new("[^a-z0-9]").unwrap();
    }

    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(name);

    let (stem, extension) = split_extension(base);

    let extension = match extension.map(str::to_lowercase) {
        Some(extension) if extension == "jpeg" => ".jpg".to_owned(),
        Some(extension) => format!(".{}", extension),
        None => String::new(),
    };

    format!("{}{}", DISALLOWED.replace_all(&stem.to_lowercase(), ""), extension)
}

/// Compute the CRC32C (Castagnoli) checksum of `content`.
///
/// This is the same value the object store reports for an object with identical content, so the two can be
/// compared directly.
pub fn checksum(content: &[u8]) -> u32 {
    crc32c::crc32c(content)
}

/// Encode a checksum the way the object store's JSON API represents it: base64 of the big-endian bytes.
pub fn encode_checksum(checksum: u32) -> String {
    base64::encode(checksum.to_be_bytes())
}

/// Inverse of [encode_checksum].
pub fn decode_checksum(encoded: &str) -> Result<u32> {
    let bytes = base64::decode(encoded)?;

    let bytes: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("expected 4 checksum bytes, got {}", bytes.len()))?;

    Ok(u32::from_be_bytes(bytes))
}

/// Map a file name to the short format name stored in [ImageRecord::file_format].
///
/// Unknown extensions pass through as the lower-cased extension itself.
pub fn file_format(name: &str) -> String {
    match split_extension(name).1.map(str::to_lowercase).as_deref() {
        Some("jpg") | Some("jpeg") => "jpeg".to_owned(),
        Some(other) => other.to_owned(),
        None => String::new(),
    }
}

/// MIME type to advertise for content of the specified format (as returned by [file_format]).
pub fn mime_type(format: &str) -> &'static str {
    match format {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

/// URL of a large, compressed rendition of the object with the specified key
pub fn full_resolution_url(key: &str) -> String {
    let (width, height) = FULL_RESOLUTION_BOUNDS;

    format!(
        "{}/{}?auto=compress&w={}&h={}&crop=entropy&fm=png",
        IMAGE_HOST, key, width, height
    )
}

/// URL of a small, cropped rendition of the object with the specified key
pub fn thumbnail_url(key: &str) -> String {
    let (width, height) = THUMBNAIL_BOUNDS;

    format!(
        "{}/{}?w={}&h={}&fit=crop&auto=compress&auto=format",
        IMAGE_HOST, key, width, height
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_names() {
        assert_eq!(format_name("Photo (1).JPEG"), "photo1.jpg");
        assert_eq!(format_name("Sunset_Over-Lake.PNG"), "sunsetoverlake.png");
        assert_eq!(format_name("already.jpg"), "already.jpg");
        assert_eq!(format_name("café.webp"), "caf.webp");
        assert_eq!(format_name("no extension"), "noextension");
        assert_eq!(format_name(".JPG"), ".jpg");
        assert_eq!(format_name("((( ))).gif"), ".gif");
        assert_eq!(format_name("some/dir/Nested File.Jpg"), "nestedfile.jpg");
        assert_eq!(format_name("archive.tar.GZ"), "archivetar.gz");
    }

    #[test]
    fn canonical_names_are_stable() {
        let stem = Regex::new("^[a-z0-9]*$").unwrap();

        for name in &[
            "Photo (1).JPEG",
            "IMG_2041.jpeg",
            "Screen Shot 2021-03-04 at 10.15.22 PM.png",
            "ÄÖÜ weird—name!.WebP",
            "",
            ".hidden",
            "x.JPEG.jpeg",
        ] {
            let once = format_name(name);
            let twice = format_name(&once);

            assert_eq!(once, twice, "not idempotent for {:?}", name);
            assert_eq!(once, format_name(name), "not deterministic for {:?}", name);
            assert!(stem.is_match(split_extension(&once).0), "bad stem for {:?}: {}", name, once);
        }
    }

    #[test]
    fn checksums() -> Result<()> {
        assert_eq!(checksum(b"123456789"), 0xe306_9283);
        assert_eq!(checksum(b""), 0);

        assert_eq!(encode_checksum(0xe306_9283), "4waSgw==");
        assert_eq!(decode_checksum("4waSgw==")?, 0xe306_9283);
        assert!(decode_checksum("AAAAAAAA").is_err());

        Ok(())
    }

    #[test]
    fn formats() {
        assert_eq!(file_format("a.jpg"), "jpeg");
        assert_eq!(file_format("a.JPEG"), "jpeg");
        assert_eq!(file_format("a.png"), "png");
        assert_eq!(file_format("a.webp"), "webp");
        assert_eq!(file_format("a.HEIC"), "heic");
        assert_eq!(file_format("a"), "");

        assert_eq!(mime_type("gif"), "image/gif");
        assert_eq!(mime_type("heic"), "image/jpeg");
    }

    #[test]
    fn urls() {
        assert_eq!(
            thumbnail_url("sunset.jpg"),
            "https://icco-walls.imgix.net/sunset.jpg?w=800&h=450&fit=crop&auto=compress&auto=format"
        );
        assert_eq!(
            full_resolution_url("sunset.jpg"),
            "https://icco-walls.imgix.net/sunset.jpg?auto=compress&w=3840&h=2160&crop=entropy&fm=png"
        );
    }

    #[test]
    fn records_serialize() -> Result<()> {
        let mut record = ImageRecord::bare(
            "sunset.jpg",
            "2021-03-01T00:00:00Z".parse()?,
            "2021-03-02T00:00:00Z".parse()?,
        );

        assert!(!record.is_processed());

        record.width = 1920;
        record.height = 1080;

        assert_eq!(record.resolution(), "1920x1080");

        let json = serde_json::to_string(&record)?;

        assert_eq!(serde_json::from_str::<ImageRecord>(&json)?, record);

        Ok(())
    }
}
