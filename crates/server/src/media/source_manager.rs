//! Registry of live media sources
//!
//! The signaling surface drives this: add a source by URL, look one
//! up for a joining subscriber, list and remove. Adding a URL that
//! is already pulled returns the existing id instead of a second
//! pull.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::Serialize;
use tracing::info;

use super::source::MediaSource;
use crate::Result;

const STREAM_ID_LEN: usize = 32;
const STREAM_ID_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn random_stream_id() -> String {
    let mut rng = rand::thread_rng();
    (0..STREAM_ID_LEN)
        .map(|_| STREAM_ID_CHARSET[rng.gen_range(0..STREAM_ID_CHARSET.len())] as char)
        .collect()
}

/// One row of the stream listing.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub url: String,
}

/// Process-wide registry of media sources.
pub struct MediaSourceManager {
    sources: Mutex<HashMap<String, Arc<MediaSource>>>,
    enable_gop_cache: bool,
}

impl MediaSourceManager {
    pub fn new(enable_gop_cache: bool) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            enable_gop_cache,
        }
    }

    /// Open and start pulling `url`, returning the stream id.
    ///
    /// A URL already being pulled returns its existing id.
    pub fn add(&self, url: &str) -> Result<String> {
        {
            let sources = self.sources.lock().unwrap();
            if let Some((id, _)) = sources.iter().find(|(_, s)| s.url() == url) {
                return Ok(id.clone());
            }
        }

        let source = MediaSource::open(url, self.enable_gop_cache)?;
        source.clone().start();

        let id = random_stream_id();
        info!(%id, %url, "media source added");
        self.sources.lock().unwrap().insert(id.clone(), source);
        Ok(id)
    }

    /// Stop and drop the source with this id, if any.
    pub fn remove(&self, id: &str) {
        let source = self.sources.lock().unwrap().remove(id);
        if let Some(source) = source {
            info!(%id, "media source removed");
            source.stop();
        }
    }

    pub fn query(&self, id: &str) -> Option<Arc<MediaSource>> {
        self.sources.lock().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<StreamInfo> {
        self.sources
            .lock()
            .unwrap()
            .iter()
            .map(|(id, source)| StreamInfo {
                id: id.clone(),
                url: source.url().to_string(),
            })
            .collect()
    }

    /// Stop every source; used at process shutdown.
    pub fn stop_all(&self) {
        let sources: Vec<_> = self.sources.lock().unwrap().drain().collect();
        for (_, source) in sources {
            source.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_shape() {
        let id = random_stream_id();
        assert_eq!(id.len(), STREAM_ID_LEN);
        assert!(id.bytes().all(|b| STREAM_ID_CHARSET.contains(&b)));
        assert_ne!(random_stream_id(), random_stream_id());
    }

    #[test]
    fn test_query_unknown_is_none() {
        let manager = MediaSourceManager::new(false);
        assert!(manager.query("nope").is_none());
        assert!(manager.list().is_empty());
        // removing an unknown id is a no-op
        manager.remove("nope");
    }
}
