//! This module defines [ObjectStore], the narrow interface through which the reconciler reads and mutates the
//! remote bucket, along with [GcsStore], an implementation backed by the Google Cloud Storage JSON API.

use {
    anyhow::{anyhow, Result},
    chrono::{DateTime, Utc},
    futures::{future::BoxFuture, FutureExt},
    reqwest::{header, Client, RequestBuilder, Response, StatusCode, Url},
    serde_derive::Deserialize,
    serde_json::json,
    tracing::info,
    walls_shared as shared,
};

const API_ROOT: &str = "https://storage.googleapis.com";

const MULTIPART_BOUNDARY: &str = "walls-3c1d0a5e9f2b4e7d";

/// An object as reported by a listing of the remote bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub checksum: u32,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Capabilities the reconciler needs from the remote bucket
///
/// Implementations are expected to treat deleting a missing object as success, and to make uploaded objects
/// publicly readable.
pub trait ObjectStore: Send + Sync {
    /// List every object in the bucket, in no particular order.
    fn list(&self) -> BoxFuture<'_, Result<Vec<RemoteObject>>>;

    /// Return the CRC32C checksum of the object named `key`, or `None` if no such object exists.
    fn checksum<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<u32>>>;

    /// Create or replace the object named `key`.
    fn upload<'a>(&'a self, key: &'a str, content: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Returned when the storage service responds with an unexpected HTTP status
#[derive(Debug, thiserror::Error)]
#[error("{} {} failed with HTTP {}: {}", method, object, status, message)]
pub struct StatusError {
    pub method: &'static str,
    pub object: String,
    pub status: StatusCode,
    pub message: String,
}

impl StatusError {
    pub(crate) async fn check(method: &'static str, object: &str, response: Response) -> Result<Response> {
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else {
            Err(StatusError {
                method,
                object: object.to_owned(),
                status,
                message: response.text().await.unwrap_or_default(),
            }
            .into())
        }
    }
}

/// Object metadata in the form the JSON API returns it
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    crc32c: Option<String>,
    size: Option<String>,
    time_created: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
}

impl ObjectResource {
    fn checksum(&self) -> Result<u32> {
        self.crc32c
            .as_deref()
            .map(shared::decode_checksum)
            .unwrap_or_else(|| Err(anyhow!("{} has no crc32c", self.name)))
    }
}

impl TryFrom<ObjectResource> for RemoteObject {
    type Error = anyhow::Error;

    fn try_from(resource: ObjectResource) -> Result<Self> {
        let created = resource
            .time_created
            .ok_or_else(|| anyhow!("{} has no creation time", resource.name))?;

        Ok(RemoteObject {
            checksum: resource.checksum()?,
            size: resource.size.as_deref().unwrap_or("0").parse()?,
            updated: resource.updated.unwrap_or(created),
            created,
            key: resource.name,
        })
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

/// [ObjectStore] implementation for a Google Cloud Storage bucket
pub struct GcsStore {
    client: Client,
    root: Url,
    bucket: String,
    access_token: String,
}

impl GcsStore {
    pub fn new(bucket: &str, access_token: &str) -> Result<Self> {
        Self::with_root(API_ROOT, bucket, access_token)
    }

    /// Create a store which talks to the JSON API at `root` instead of the public endpoint.
    pub fn with_root(root: &str, bucket: &str, access_token: &str) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            root: root.parse()?,
            bucket: bucket.to_owned(),
            access_token: access_token.to_owned(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.root.clone();

        url.path_segments_mut()
            .map_err(|_| anyhow!("invalid API root: {}", self.root))?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    fn objects_url(&self) -> Result<Url> {
        self.url(&["storage", "v1", "b", &self.bucket, "o"])
    }

    fn object_url(&self, key: &str) -> Result<Url> {
        self.url(&["storage", "v1", "b", &self.bucket, "o", key])
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.access_token)
    }

    async fn list_all(&self) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        let mut page_token = None::<String>;

        loop {
            let mut url = self.objects_url()?;

            url.query_pairs_mut().append_pair("projection", "noAcl");

            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            let response = self.authorize(self.client.get(url)).send().await?;

            let page = StatusError::check("list", &self.bucket, response)
                .await?
                .json::<ObjectList>()
                .await?;

            for item in page.items {
                objects.push(RemoteObject::try_from(item)?);
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        info!("listed {} objects in {}", objects.len(), self.bucket);

        Ok(objects)
    }

    async fn object_checksum(&self, key: &str) -> Result<Option<u32>> {
        let response = self
            .authorize(self.client.get(self.object_url(key)?))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        StatusError::check("get", key, response)
            .await?
            .json::<ObjectResource>()
            .await?
            .checksum()
            .map(Some)
    }

    /// Build a multipart/related upload body carrying both the object metadata (including the checksum, which the
    /// service verifies) and the content.
    fn multipart_body(key: &str, content: &[u8]) -> Result<Vec<u8>> {
        let metadata = json!({
            "name": key,
            "crc32c": shared::encode_checksum(shared::checksum(content)),
            "contentType": shared::mime_type(&shared::file_format(key)),
        });

        let mut body = Vec::with_capacity(content.len() + 512);

        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{}\r\n--{}\r\nContent-Type: {}\r\n\r\n",
                MULTIPART_BOUNDARY,
                serde_json::to_string(&metadata)?,
                MULTIPART_BOUNDARY,
                shared::mime_type(&shared::file_format(key)),
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());

        Ok(body)
    }

    async fn upload_object(&self, key: &str, content: &[u8]) -> Result<()> {
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;

        url.query_pairs_mut()
            .append_pair("uploadType", "multipart")
            .append_pair("predefinedAcl", "publicRead");

        let response = self
            .authorize(self.client.post(url))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(Self::multipart_body(key, content)?)
            .send()
            .await?;

        StatusError::check("upload", key, response).await?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let response = self
            .authorize(self.client.delete(self.object_url(key)?))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        StatusError::check("delete", key, response).await?;

        Ok(())
    }
}

impl ObjectStore for GcsStore {
    fn list(&self) -> BoxFuture<'_, Result<Vec<RemoteObject>>> {
        self.list_all().boxed()
    }

    fn checksum<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<u32>>> {
        self.object_checksum(key).boxed()
    }

    fn upload<'a>(&'a self, key: &'a str, content: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        self.upload_object(key, content).boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        self.delete_object(key).boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn urls() -> Result<()> {
        let store = GcsStore::new("walls", "token")?;

        assert_eq!(
            store.objects_url()?.as_str(),
            "https://storage.googleapis.com/storage/v1/b/walls/o"
        );
        assert_eq!(
            store.object_url("odd name+1.jpg")?.as_str(),
            "https://storage.googleapis.com/storage/v1/b/walls/o/odd%20name+1.jpg"
        );
        assert_eq!(
            store.object_url("dir/file.jpg")?.as_str(),
            "https://storage.googleapis.com/storage/v1/b/walls/o/dir%2Ffile.jpg"
        );

        Ok(())
    }

    #[test]
    fn object_resources() -> Result<()> {
        let resource = serde_json::from_str::<ObjectResource>(
            r#"{
                 "kind": "storage#object",
                 "name": "sunset.jpg",
                 "size": "12345",
                 "crc32c": "4waSgw==",
                 "timeCreated": "2021-03-01T10:00:00.000Z",
                 "updated": "2021-03-02T10:00:00.000Z"
               }"#,
        )?;

        assert_eq!(
            RemoteObject::try_from(resource)?,
            RemoteObject {
                key: "sunset.jpg".to_owned(),
                checksum: 0xe306_9283,
                size: 12345,
                created: "2021-03-01T10:00:00Z".parse()?,
                updated: "2021-03-02T10:00:00Z".parse()?,
            }
        );

        let list = serde_json::from_str::<ObjectList>(r#"{"kind": "storage#objects"}"#)?;

        assert!(list.items.is_empty());
        assert!(list.next_page_token.is_none());

        Ok(())
    }

    #[test]
    fn multipart() -> Result<()> {
        let body = String::from_utf8(GcsStore::multipart_body("a.png", b"123456789")?)?;

        assert!(body.starts_with(&format!("--{}\r\n", MULTIPART_BOUNDARY)));
        assert!(body.contains(r#""crc32c":"4waSgw==""#));
        assert!(body.contains("\r\nContent-Type: image/png\r\n\r\n123456789\r\n"));
        assert!(body.ends_with(&format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY)));

        Ok(())
    }
}
