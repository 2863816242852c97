//! `stub://` source descriptions shared by the synthetic file and camera
//! readers.
//!
//! Syntax: `stub://<name>?key=value&key=value`. Unknown keys are ignored so a
//! stub path can carry annotations for humans.

use anyhow::{anyhow, Context, Result};

pub(crate) const STUB_SCHEME: &str = "stub://";

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StubSpec {
    pub name: String,
    params: Vec<(String, String)>,
}

impl StubSpec {
    pub(crate) fn parse(path: &str) -> Result<Self> {
        let rest = path
            .strip_prefix(STUB_SCHEME)
            .ok_or_else(|| anyhow!("not a stub path: {}", path))?;
        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, query),
            None => (rest, ""),
        };
        let params = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();
        Ok(Self {
            name: name.to_string(),
            params,
        })
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)
            .map(|value| {
                value
                    .parse::<u64>()
                    .with_context(|| format!("stub parameter {}={} is not a number", key, value))
            })
            .transpose()
    }
}

pub(crate) fn is_stub(path: &str) -> bool {
    path.starts_with(STUB_SCHEME)
}

/// Deterministic test pattern for synthetic frames.
pub(crate) fn synthetic_pixels(width: u32, height: u32, frame_index: u64) -> Vec<u8> {
    let pixel_count = width as usize * height as usize * 3;
    let mut pixels = vec![0u8; pixel_count];
    for (i, pixel) in pixels.iter_mut().enumerate() {
        *pixel = ((i as u64 + frame_index * 7) % 256) as u8;
    }
    pixels
}
