//! Release metadata retrieval with endpoint fallback

use crate::error::{Result, UpdateError};
use crate::version::Version;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Description of the newest published release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub name: String,
    pub version: Version,
    pub is_beta: bool,
    pub changelog: String,
    pub download_url: String,
    pub download_path: String,
    pub complete_download_url: String,
}

impl UpdateInfo {
    /// URL of the installer: the complete URL verbatim when present, otherwise
    /// `<downloadURL><downloadPath><version><extension>`.
    pub fn artifact_url(&self, extension: &str) -> String {
        if self.complete_download_url.is_empty() {
            format!(
                "{}{}{}{}",
                self.download_url, self.download_path, self.version, extension
            )
        } else {
            self.complete_download_url.clone()
        }
    }

    pub fn artifact_file_name(&self, extension: &str) -> String {
        format!("{}{}", self.version, extension)
    }
}

#[derive(Debug, Deserialize)]
struct MetadataDocument {
    program: ProgramSection,
}

#[derive(Debug, Deserialize)]
struct ProgramSection {
    #[serde(default)]
    name: String,
    version: String,
    #[serde(default, deserialize_with = "deserialize_flag")]
    beta: bool,
    #[serde(default)]
    changelog: String,
    #[serde(default, rename = "downloadURL")]
    download_url: String,
    #[serde(default, rename = "downloadPath")]
    download_path: String,
    #[serde(default, rename = "completeDownloadURL")]
    complete_download_url: String,
}

/// XML elements only carry text, so the flag arrives as a string there.
#[derive(Debug, Deserialize)]
struct XmlMetadataDocument {
    program: XmlProgramSection,
}

#[derive(Debug, Deserialize)]
struct XmlProgramSection {
    #[serde(default)]
    name: String,
    version: String,
    #[serde(default)]
    beta: String,
    #[serde(default)]
    changelog: String,
    #[serde(default, rename = "downloadURL")]
    download_url: String,
    #[serde(default, rename = "downloadPath")]
    download_path: String,
    #[serde(default, rename = "completeDownloadURL")]
    complete_download_url: String,
}

impl From<XmlMetadataDocument> for MetadataDocument {
    fn from(document: XmlMetadataDocument) -> Self {
        let program = document.program;
        MetadataDocument {
            program: ProgramSection {
                name: program.name,
                version: program.version,
                beta: program.beta.trim() == "1",
                changelog: program.changelog,
                download_url: program.download_url.trim().to_string(),
                download_path: program.download_path.trim().to_string(),
                complete_download_url: program.complete_download_url.trim().to_string(),
            },
        }
    }
}

/// Only the literal `1` switches a flag on.
fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Text(String),
        Number(i64),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Text(text)) => text == "1",
        Some(Flag::Number(n)) => n == 1,
        Some(Flag::Other(_)) | None => false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentFormat {
    Json,
    Yaml,
    Xml,
}

impl DocumentFormat {
    fn detect(endpoint: &str, content_type: Option<&str>, body: &str) -> Self {
        let content_type = content_type.unwrap_or_default().to_lowercase();
        let path = endpoint
            .split(['?', '#'])
            .next()
            .unwrap_or(endpoint)
            .to_lowercase();
        if content_type.contains("yaml") || path.ends_with(".yaml") || path.ends_with(".yml") {
            DocumentFormat::Yaml
        } else if content_type.contains("xml")
            || path.ends_with(".xml")
            || body.trim_start_matches('\u{feff}').trim_start().starts_with('<')
        {
            DocumentFormat::Xml
        } else {
            DocumentFormat::Json
        }
    }
}

pub fn parse_metadata(endpoint: &str, body: &str, content_type: Option<&str>) -> Result<UpdateInfo> {
    let malformed = |reason: String| UpdateError::MetadataParse {
        endpoint: endpoint.to_string(),
        reason,
    };

    let document: MetadataDocument = match DocumentFormat::detect(endpoint, content_type, body) {
        DocumentFormat::Json => serde_json::from_str(body).map_err(|e| malformed(e.to_string()))?,
        DocumentFormat::Yaml => serde_yaml::from_str(body).map_err(|e| malformed(e.to_string()))?,
        DocumentFormat::Xml => quick_xml::de::from_str::<XmlMetadataDocument>(body)
            .map_err(|e| malformed(e.to_string()))?
            .into(),
    };

    let program = document.program;
    let version = Version::parse(&program.version).map_err(|e| malformed(e.to_string()))?;

    Ok(UpdateInfo {
        name: program.name,
        version,
        is_beta: program.beta,
        changelog: program.changelog,
        download_url: program.download_url,
        download_path: program.download_path,
        complete_download_url: program.complete_download_url,
    })
}

#[derive(Debug, Clone)]
pub struct MetadataFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl MetadataFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Try each endpoint in order and return the first release description.
    ///
    /// Network failures fall through to the next endpoint. A response that
    /// arrives but cannot be parsed ends the fetch with `MetadataParse`.
    pub async fn fetch(&self, endpoints: &[String]) -> Result<UpdateInfo> {
        let mut attempts = Vec::new();

        for endpoint in endpoints {
            tracing::debug!("Fetching release metadata from: {}", endpoint);

            match self.download(endpoint).await {
                Ok((body, content_type)) => {
                    let info = parse_metadata(endpoint, &body, content_type.as_deref())?;
                    tracing::info!(
                        "Endpoint {} advertises {} {}",
                        endpoint,
                        if info.name.is_empty() { "release" } else { info.name.as_str() },
                        info.version
                    );
                    return Ok(info);
                }
                Err(reason) => {
                    tracing::warn!("Endpoint {} unreachable: {}", endpoint, reason);
                    attempts.push(format!("{}: {}", endpoint, reason));
                }
            }
        }

        Err(UpdateError::Unreachable { attempts })
    }

    async fn download(&self, endpoint: &str) -> std::result::Result<(String, Option<String>), String> {
        let response = self
            .client
            .get(endpoint)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("server returned {}", status));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .text()
            .await
            .map_err(|e| format!("failed to read response: {}", e))?;

        Ok((body, content_type))
    }
}
