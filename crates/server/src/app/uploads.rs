use reqwest::multipart::{Form, Part};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use tokio::fs;

#[derive(Debug)]
pub enum UploadError {
    Io,
    Transport,
}

impl Display for UploadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "attachment read failure"),
            Self::Transport => write!(f, "file service transport failure"),
        }
    }
}

impl Error for UploadError {}

/// Forwards a local file to the file service as a multipart form with a
/// single `file` part, replaying the caller's credential. Returns the HTTP
/// status and raw body; the body of a 200 is the stored handle as a JSON
/// string. Type and size limits are the file service's concern.
pub async fn upload_attachment(
    http: &reqwest::Client,
    files_service_url: &str,
    bearer: &str,
    path: &str,
) -> Result<(u16, Vec<u8>), UploadError> {
    let bytes = fs::read(path).await.map_err(|_| UploadError::Io)?;
    let file_name = Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("file")
        .to_string();
    let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name));
    let response = http
        .post(format!("{}/upload", files_service_url))
        .header("Authorization", bearer)
        .multipart(form)
        .send()
        .await
        .map_err(|_| UploadError::Transport)?;
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map_err(|_| UploadError::Transport)?
        .to_vec();
    Ok((status, body))
}

/// Decodes the file service's 200 body into the stored file handle.
pub fn parse_file_handle(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<String>(body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_handle_decodes_json_string() {
        assert_eq!(
            parse_file_handle(b"\"uploads/ab12cd.png\""),
            Some("uploads/ab12cd.png".to_string())
        );
    }

    #[test]
    fn file_handle_rejects_non_string_body() {
        assert_eq!(parse_file_handle(b"{\"path\":\"x\"}"), None);
        assert_eq!(parse_file_handle(b"not json"), None);
    }

    #[test]
    fn upload_error_display() {
        assert_eq!(UploadError::Io.to_string(), "attachment read failure");
    }
}
