use {
    crate::{analysis::WordExtractor, remote::StatusError},
    anyhow::{anyhow, Result},
    futures::{future::BoxFuture, FutureExt},
    reqwest::{Client, Url},
    serde_derive::{Deserialize, Serialize},
    walls_shared::words,
};

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const ENDPOINT: &str = "https://generativelanguage.googleapis.com";

const PROMPT: &str = "Analyze this image and provide:
1. Any text visible in the image (OCR)
2. Keywords describing what's in the image (objects, scenery, mood, style, colors)

Return ONLY a comma-separated list of single words or short phrases (2-3 words max).
Do not include sentences, explanations, or categories.
Example output: mountain, sunset, orange sky, peaceful, landscape, snow peak, clouds

Words:";

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Blob<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RequestPart<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<Blob<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Serialize, Debug)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize, Debug)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

impl<'a> GenerateRequest<'a> {
    fn new(content: &[u8], mime_type: &'a str) -> Self {
        Self {
            contents: vec![RequestContent {
                parts: vec![
                    RequestPart {
                        inline_data: Some(Blob {
                            mime_type,
                            data: base64::encode(content),
                        }),
                        text: None,
                    },
                    RequestPart {
                        inline_data: None,
                        text: Some(PROMPT),
                    },
                ],
            }],
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    #[serde(default)]
    content: ResponseContent,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GenerateResponse {
    /// Concatenated text parts of the first candidate
    fn text(&self) -> String {
        self.candidates
            .first()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// [WordExtractor] which asks a Gemini model to transcribe and describe each image
pub struct Gemini {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
}

impl Gemini {
    /// Create an extractor for `model`.  Without an API key, every extraction fails (and so yields no words).
    pub fn new(api_key: Option<String>, model: &str) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            endpoint: ENDPOINT.parse()?,
            model: model.to_owned(),
            api_key: api_key.filter(|key| !key.is_empty()),
        })
    }

    fn url(&self, api_key: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();

        url.path_segments_mut()
            .map_err(|_| anyhow!("invalid endpoint: {}", self.endpoint))?
            .pop_if_empty()
            .extend(&["v1beta", "models", &format!("{}:generateContent", self.model)]);

        url.query_pairs_mut().append_pair("key", api_key);

        Ok(url)
    }

    async fn generate(&self, content: &[u8], mime_type: &str) -> Result<Vec<String>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("GEMINI_API_KEY not set"))?;

        let response = self
            .client
            .post(self.url(api_key)?)
            .json(&GenerateRequest::new(content, mime_type))
            .send()
            .await?;

        let response = StatusError::check("generate", &self.model, response)
            .await?
            .json::<GenerateResponse>()
            .await?;

        Ok(words::parse_words(&response.text()))
    }
}

impl WordExtractor for Gemini {
    fn words<'a>(&'a self, content: &'a [u8], mime_type: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        self.generate(content, mime_type).boxed()
    }
}

#[cfg(test)]
mod test {
    use {super::*, serde_json::json};

    #[test]
    fn request() -> Result<()> {
        let gemini = Gemini::new(Some("secret".to_owned()), DEFAULT_MODEL)?;

        assert_eq!(
            gemini.url("secret")?.as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent?key=secret"
        );

        let request = serde_json::to_value(&GenerateRequest::new(b"123", "image/png"))?;

        assert_eq!(
            request,
            json!({
                "contents": [{
                    "parts": [
                        { "inlineData": { "mimeType": "image/png", "data": "MTIz" } },
                        { "text": PROMPT }
                    ]
                }]
            })
        );

        Ok(())
    }

    #[test]
    fn response() -> Result<()> {
        let response = serde_json::from_str::<GenerateResponse>(
            r#"{
                 "candidates": [
                   {
                     "content": {
                       "role": "model",
                       "parts": [{ "text": "Mountain, *Sunset*,\n" }, { "text": "OPEN 24 HOURS, (no text)" }]
                     },
                     "finishReason": "STOP"
                   },
                   { "content": { "parts": [{ "text": "ignored" }] } }
                 ]
               }"#,
        )?;

        assert_eq!(
            words::parse_words(&response.text()),
            vec!["mountain", "sunset", "open 24 hours"]
        );

        let empty = serde_json::from_str::<GenerateResponse>(r#"{"promptFeedback": {}}"#)?;

        assert_eq!(empty.text(), "");

        let blocked = serde_json::from_str::<GenerateResponse>(r#"{"candidates": [{"finishReason": "SAFETY"}]}"#)?;

        assert_eq!(blocked.text(), "");

        Ok(())
    }

    #[tokio::test]
    async fn missing_key() -> Result<()> {
        let gemini = Gemini::new(Some(String::new()), DEFAULT_MODEL)?;

        assert!(gemini.words(b"123", "image/jpeg").await.is_err());

        Ok(())
    }
}
