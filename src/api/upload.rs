//! `POST /upload`: store a video under the upload directory and make it the
//! active file source.
//!
//! Accepts either a `multipart/form-data` body with a `file` field (what a
//! browser form sends) or a raw body with the name in `?filename=`. Raw
//! bodies are streamed to disk; form bodies are buffered, bounded by the
//! upload limit.

use anyhow::{Context, Result};
use serde_json::json;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use super::{write_json_response, ApiConfig, ApiContext, HttpRequest};

pub(super) fn handle(
    stream: &mut TcpStream,
    request: HttpRequest,
    cfg: &ApiConfig,
    ctx: &ApiContext,
) -> Result<()> {
    let length = match request.content_length() {
        Ok(Some(length)) => length,
        Ok(None) => {
            write_json_response(stream, 411, &json!({"error": "Content-Length required"}))?;
            return Ok(());
        }
        Err(err) => {
            write_json_response(stream, 400, &json!({"error": err.to_string()}))?;
            return Ok(());
        }
    };
    if length > cfg.max_upload_bytes {
        write_json_response(
            stream,
            413,
            &json!({"error": format!("upload exceeds {} bytes", cfg.max_upload_bytes)}),
        )?;
        return Ok(());
    }

    if ctx.manager.flags().camera_active {
        ctx.manager.stop();
    }

    let boundary = request
        .header("content-type")
        .and_then(multipart_boundary)
        .map(str::to_string);
    let saved = match boundary {
        Some(boundary) => save_form_upload(stream, &request, length, &boundary, &cfg.upload_dir),
        None => save_raw_upload(stream, &request, length, &cfg.upload_dir),
    };
    let path = match saved {
        Ok(Ok(path)) => path,
        Ok(Err(rejection)) => {
            write_json_response(stream, 400, &json!({"error": rejection}))?;
            return Ok(());
        }
        Err(err) => {
            write_json_response(stream, 500, &json!({"error": format!("{:#}", err)}))?;
            return Err(err);
        }
    };

    log::info!("api: stored upload at {}", path.display());
    let path_str = path.to_string_lossy().into_owned();
    match ctx.manager.open_file(&path_str) {
        Ok(()) => write_json_response(
            stream,
            200,
            &json!({
                "message": "File uploaded successfully",
                "video_feed": "/video_feed",
            }),
        ),
        Err(err) => write_json_response(stream, 500, &json!({"error": err.to_string()})),
    }
}

/// Outer error: I/O trouble. Inner error: the client sent something unusable.
type Saved = Result<std::result::Result<PathBuf, &'static str>>;

fn save_raw_upload(
    stream: &mut TcpStream,
    request: &HttpRequest,
    length: u64,
    upload_dir: &Path,
) -> Saved {
    let filename = match request.query.get("filename") {
        Some(name) => sanitize_filename(name),
        None => {
            discard_body(stream, request, length)?;
            return Ok(Err("No file part"));
        }
    };
    if filename.is_empty() {
        discard_body(stream, request, length)?;
        return Ok(Err("No selected file"));
    }

    let target = prepare_target(upload_dir, &filename)?;
    let partial = target.with_extension("part");
    let mut file = std::fs::File::create(&partial)
        .with_context(|| format!("create {}", partial.display()))?;

    let prefix_len = (request.body_prefix.len() as u64).min(length);
    file.write_all(&request.body_prefix[..prefix_len as usize])?;
    let remaining = length - prefix_len;
    let copied = std::io::copy(&mut Read::by_ref(stream).take(remaining), &mut file)?;
    if copied != remaining {
        drop(file);
        let _ = std::fs::remove_file(&partial);
        return Ok(Err("upload body truncated"));
    }
    file.flush()?;
    drop(file);
    std::fs::rename(&partial, &target)
        .with_context(|| format!("move upload into {}", target.display()))?;
    Ok(Ok(target))
}

fn save_form_upload(
    stream: &mut TcpStream,
    request: &HttpRequest,
    length: u64,
    boundary: &str,
    upload_dir: &Path,
) -> Saved {
    let mut body = request.body_prefix.clone();
    body.truncate(length as usize);
    let remaining = length - body.len() as u64;
    Read::by_ref(stream).take(remaining).read_to_end(&mut body)?;
    if body.len() as u64 != length {
        return Ok(Err("upload body truncated"));
    }

    let Some(part) = multipart_file(&body, boundary) else {
        return Ok(Err("No file part"));
    };
    let filename = sanitize_filename(&part.filename);
    if filename.is_empty() {
        return Ok(Err("No selected file"));
    }
    let target = prepare_target(upload_dir, &filename)?;
    std::fs::write(&target, part.data)
        .with_context(|| format!("write upload {}", target.display()))?;
    Ok(Ok(target))
}

/// Read and drop the rest of a rejected body so the client sees the response
/// instead of a reset.
fn discard_body(stream: &mut TcpStream, request: &HttpRequest, length: u64) -> Result<()> {
    let remaining = length.saturating_sub(request.body_prefix.len() as u64);
    std::io::copy(&mut Read::by_ref(stream).take(remaining), &mut std::io::sink())?;
    Ok(())
}

fn prepare_target(upload_dir: &Path, filename: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(upload_dir)
        .with_context(|| format!("create upload dir {}", upload_dir.display()))?;
    Ok(upload_dir.join(filename))
}

/// Reduce a client-supplied name to a safe basename: ASCII letters, digits,
/// `.`, `-` and `_`, whitespace folded to `_`, no leading or trailing dots or
/// underscores.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or("");
    let cleaned: String = base
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    cleaned.trim_matches(|c| c == '.' || c == '_').to_string()
}

fn multipart_boundary(content_type: &str) -> Option<&str> {
    let mut params = content_type.split(';').map(str::trim);
    let mime = params.next()?;
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
}

struct FilePart<'a> {
    filename: String,
    data: &'a [u8],
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// First form part named `file`. A part with an empty filename is returned
/// as-is so the caller can tell "no file chosen" from "no file field".
fn multipart_file<'a>(body: &'a [u8], boundary: &str) -> Option<FilePart<'a>> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let separator = [b"\r\n".as_slice(), delimiter.as_slice()].concat();
    let mut pos = find(body, &delimiter, 0)? + delimiter.len();
    loop {
        if body.get(pos..pos + 2) == Some(b"--".as_slice()) {
            return None;
        }
        let headers_start = pos + 2;
        let headers_end = find(body, b"\r\n\r\n", headers_start)?;
        let headers = String::from_utf8_lossy(&body[headers_start..headers_end]);
        let content_start = headers_end + 4;
        let content_end = find(body, &separator, content_start)?;

        let (name, filename) = content_disposition(&headers);
        if name.as_deref() == Some("file") {
            return Some(FilePart {
                filename: filename.unwrap_or_default(),
                data: &body[content_start..content_end],
            });
        }
        pos = content_end + separator.len();
    }
}

fn content_disposition(headers: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut filename = None;
    for line in headers.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("content-disposition") {
            continue;
        }
        for param in value.split(';').map(str::trim) {
            if let Some((k, v)) = param.split_once('=') {
                let v = v.trim().trim_matches('"').to_string();
                match k.trim().to_ascii_lowercase().as_str() {
                    "name" => name = Some(v),
                    "filename" => filename = Some(v),
                    _ => {}
                }
            }
        }
    }
    (name, filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form_request(content_type: &str) -> HttpRequest {
        let mut headers = std::collections::HashMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        HttpRequest {
            method: "POST".to_string(),
            path: "/upload".to_string(),
            raw_path: "/upload".to_string(),
            query: Default::default(),
            headers,
            body_prefix: Vec::new(),
        }
    }

    #[test]
    fn filenames_are_reduced_to_safe_basenames() {
        assert_eq!(sanitize_filename("road trip.mp4"), "road_trip.mp4");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\videos\\clip.mjpg"), "clip.mjpg");
        assert_eq!(sanitize_filename("..."), "");
        assert_eq!(sanitize_filename("pothole€.mjpg"), "pothole.mjpg");
    }

    #[test]
    fn boundary_is_read_from_content_type() {
        let request = form_request("multipart/form-data; boundary=\"----abc\"");
        assert_eq!(
            request.header("content-type").and_then(multipart_boundary),
            Some("----abc")
        );
        assert_eq!(multipart_boundary("application/octet-stream"), None);
    }

    #[test]
    fn file_part_is_extracted() {
        let body = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"note\"\r\n\r\n\
hello\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"road.mjpg\"\r\n\
Content-Type: video/x-motion-jpeg\r\n\r\n\
\xFF\xD8data\xFF\xD9\r\n\
--XyZ--\r\n";
        let part = multipart_file(body, "XyZ").expect("file part");
        assert_eq!(part.filename, "road.mjpg");
        assert_eq!(part.data, b"\xFF\xD8data\xFF\xD9");
    }

    #[test]
    fn missing_file_field_is_none() {
        let body = b"--XyZ\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhi\r\n--XyZ--\r\n";
        assert!(multipart_file(body, "XyZ").is_none());
    }
}
