//! Multipart upload to platform media endpoints.

use std::path::Path;

use crate::{
    error::{Error, Result},
    mime,
    store::MediaService,
};

/// One multipart upload. The access token rides in the URL query string
/// or a header, as the platform requires.
#[derive(Debug, Clone)]
pub struct UploadRequest<'a> {
    pub url: &'a str,
    /// Form field name for the file part (`media`, `image`, `file`, ...).
    pub field: &'a str,
    pub path: &'a Path,
    pub filename: Option<&'a str>,
    /// Additional plain form fields (`image_type=message`, ...).
    pub extra_fields: &'a [(&'a str, &'a str)],
    /// Bearer token for platforms that authenticate uploads by header.
    pub bearer: Option<&'a str>,
}

impl MediaService {
    /// Upload a local file and return the platform's JSON response. The
    /// multipart boundary is unique per request.
    pub async fn upload(&self, req: UploadRequest<'_>) -> Result<serde_json::Value> {
        let filename = req
            .filename
            .map(str::to_string)
            .or_else(|| {
                req.path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            })
            .ok_or_else(|| Error::invalid_input("upload path has no file name"))?;
        let mime_type = mime::mime_for_filename(&filename);

        let bytes = tokio::fs::read(req.path).await?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str(mime_type)
            .map_err(|e| Error::external("invalid mime for upload part", e))?;
        let mut form = reqwest::multipart::Form::new().part(req.field.to_string(), part);
        for (name, value) in req.extra_fields {
            form = form.text((*name).to_string(), (*value).to_string());
        }

        let mut request = self
            .client
            .post(req.url)
            .timeout(self.config().upload_timeout)
            .multipart(form);
        if let Some(token) = req.bearer {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let response = request.send().await?.error_for_status()?;

        Ok(response.json().await?)
    }
}

/// Pull `media_id` out of a WeCom-style upload response, surfacing the
/// platform errcode when present.
pub fn media_id_from_response(value: &serde_json::Value) -> Result<String> {
    if let Some(code) = value.get("errcode").and_then(serde_json::Value::as_i64)
        && code != 0
    {
        let msg = value.get("errmsg").and_then(serde_json::Value::as_str).unwrap_or("");
        return Err(Error::invalid_input(format!("upload failed: {code} {msg}")));
    }
    value
        .get("media_id")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_input("upload response carries no media_id"))
}
