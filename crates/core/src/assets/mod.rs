//! Locating and fetching model files and their dependencies.
//!
//! Everything is addressed by [`Url`] so that references inside a model
//! (textures, motions, sidecar meshes) resolve the same way whether the model
//! came from disk or from memory.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    path::Path,
    rc::Rc,
    time::Duration,
};

use async_trait::async_trait;
use tracing::{debug, trace};
use url::Url;

use crate::{formats::normalize_reference, CompanionError, Result};

/// Turns a local path into a `file://` URL. Relative paths are taken from the
/// current directory.
pub fn path_to_url(path: &Path) -> Result<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&absolute).map_err(|_| {
        CompanionError::msg(format!("cannot express `{}` as a URL", absolute.display()))
    })
}

/// Resolves references found inside a model relative to the model itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetResolver {
    model: Url,
}

impl AssetResolver {
    pub fn new(model: Url) -> Self {
        Self { model }
    }

    pub fn for_path(path: &Path) -> Result<Self> {
        Ok(Self::new(path_to_url(path)?))
    }

    pub fn model_url(&self) -> &Url {
        &self.model
    }

    /// Absolute URLs pass through; anything else, including Windows-style
    /// `dir\file` references, is joined onto the model's directory.
    pub fn resolve(&self, reference: &str) -> Result<Url> {
        let reference = normalize_reference(reference);
        match Url::parse(&reference) {
            // A single-letter scheme is a drive letter, not a URL.
            Ok(url) if url.scheme().len() > 1 => Ok(url),
            Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => {
                if Path::new(&reference).is_absolute() || reference.starts_with('/') {
                    path_to_url(Path::new(&reference))
                } else {
                    Ok(self.model.join(&reference)?)
                }
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Source of raw asset bytes.
#[async_trait(?Send)]
pub trait AssetFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>>;
}

/// Reads `file://` URLs from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

#[async_trait(?Send)]
impl AssetFetcher for FileFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        if url.scheme() != "file" {
            return Err(CompanionError::msg(format!(
                "unsupported asset scheme `{}`",
                url.scheme()
            )));
        }
        let path = url
            .to_file_path()
            .map_err(|_| CompanionError::msg(format!("`{url}` is not a local file")))?;
        trace!(path = %path.display(), "reading asset");
        Ok(tokio::fs::read(&path).await?)
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    bytes: Vec<u8>,
    delay: Option<Duration>,
    fetches: usize,
}

/// In-memory assets keyed by URL, each with an optional artificial latency.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    entries: RefCell<HashMap<String, MemoryEntry>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &Url, bytes: impl Into<Vec<u8>>) {
        self.entries.borrow_mut().insert(
            url.to_string(),
            MemoryEntry {
                bytes: bytes.into(),
                delay: None,
                fetches: 0,
            },
        );
    }

    /// Registers `bytes` under the `file://` URL of `path`.
    pub fn insert_path(&self, path: impl AsRef<Path>, bytes: impl Into<Vec<u8>>) -> Result<Url> {
        let url = path_to_url(path.as_ref())?;
        self.insert(&url, bytes);
        Ok(url)
    }

    pub fn set_delay(&self, url: &Url, delay: Duration) {
        if let Some(entry) = self.entries.borrow_mut().get_mut(url.as_str()) {
            entry.delay = Some(delay);
        }
    }

    pub fn fetch_count(&self, url: &Url) -> usize {
        self.entries
            .borrow()
            .get(url.as_str())
            .map(|entry| entry.fetches)
            .unwrap_or(0)
    }
}

#[async_trait(?Send)]
impl AssetFetcher for MemoryFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let (bytes, delay) = {
            let mut entries = self.entries.borrow_mut();
            let entry = entries.get_mut(url.as_str()).ok_or_else(|| {
                CompanionError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no asset at {url}"),
                ))
            })?;
            entry.fetches += 1;
            (entry.bytes.clone(), entry.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(bytes)
    }
}

/// Hands out [`LoadTicket`]s. Issuing a ticket invalidates every earlier one,
/// so the most recent load always wins.
#[derive(Debug, Clone, Default)]
pub struct LoadSequencer {
    generation: Rc<Cell<u64>>,
}

impl LoadSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> LoadTicket {
        let id = self.generation.get() + 1;
        self.generation.set(id);
        LoadTicket {
            id,
            generation: self.generation.clone(),
        }
    }

    /// Invalidates outstanding tickets without starting a new load.
    pub fn invalidate(&self) {
        self.generation.set(self.generation.get() + 1);
    }
}

#[derive(Debug, Clone)]
pub struct LoadTicket {
    id: u64,
    generation: Rc<Cell<u64>>,
}

impl LoadTicket {
    /// A ticket nobody else can supersede.
    pub fn detached() -> Self {
        LoadSequencer::new().issue()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_current(&self) -> bool {
        self.generation.get() == self.id
    }

    pub fn ensure_current(&self) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(CompanionError::Cancelled)
        }
    }
}

/// Everything one model load needs: where the model lives, how to fetch
/// bytes, how long to wait, and whether the load is still wanted.
#[derive(Clone)]
pub struct LoadContext {
    fetcher: Rc<dyn AssetFetcher>,
    resolver: AssetResolver,
    ticket: LoadTicket,
    timeout: Duration,
}

impl std::fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadContext")
            .field("model", &self.resolver.model_url().as_str())
            .field("ticket", &self.ticket.id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LoadContext {
    pub fn new(
        fetcher: Rc<dyn AssetFetcher>,
        resolver: AssetResolver,
        ticket: LoadTicket,
        timeout_ms: u64,
    ) -> Self {
        Self {
            fetcher,
            resolver,
            ticket,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn ticket(&self) -> &LoadTicket {
        &self.ticket
    }

    pub fn resolver(&self) -> &AssetResolver {
        &self.resolver
    }

    pub fn ensure_current(&self) -> Result<()> {
        self.ticket.ensure_current()
    }

    /// Fetches with the load timeout, then checks the ticket again since a
    /// newer load may have started while this one was suspended.
    pub async fn fetch_url(&self, url: &Url) -> Result<Vec<u8>> {
        self.ticket.ensure_current()?;
        let bytes = tokio::time::timeout(self.timeout, self.fetcher.fetch(url))
            .await
            .map_err(|_| CompanionError::LoadTimeout {
                path: url.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;
        self.ticket.ensure_current()?;
        debug!(url = %url, bytes = bytes.len(), "fetched asset");
        Ok(bytes)
    }

    pub async fn fetch_model(&self) -> Result<Vec<u8>> {
        let url = self.resolver.model_url().clone();
        self.fetch_url(&url).await
    }

    /// Fetches a reference found inside the model.
    pub async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        let url = self.resolver.resolve(reference)?;
        self.fetch_url(&url).await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn model_url() -> Url {
        Url::parse("file:///models/miku/miku.pmx").unwrap()
    }

    #[test]
    fn resolves_relative_references() {
        let resolver = AssetResolver::new(model_url());
        assert_eq!(
            resolver.resolve(r"tex\body.png").unwrap().as_str(),
            "file:///models/miku/tex/body.png"
        );
        assert_eq!(
            resolver.resolve("../shared/toon 01.bmp").unwrap().as_str(),
            "file:///models/shared/toon%2001.bmp"
        );
        assert_eq!(
            resolver.resolve("https://cdn.example/a.png").unwrap().as_str(),
            "https://cdn.example/a.png"
        );
    }

    #[test]
    fn sequencer_supersedes_older_tickets() {
        let sequencer = LoadSequencer::new();
        let first = sequencer.issue();
        assert!(first.is_current());
        let second = sequencer.issue();
        assert!(!first.is_current());
        assert!(matches!(first.ensure_current(), Err(CompanionError::Cancelled)));
        assert!(second.is_current());
        sequencer.invalidate();
        assert!(!second.is_current());
    }

    #[tokio::test]
    async fn file_fetcher_reads_local_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"PMX ").unwrap();
        let url = path_to_url(file.path()).unwrap();

        assert_eq!(FileFetcher.fetch(&url).await.unwrap(), b"PMX ");
    }

    #[tokio::test]
    async fn memory_fetcher_reports_missing_assets() {
        let fetcher = MemoryFetcher::new();
        let err = fetcher.fetch(&model_url()).await.unwrap_err();
        assert!(matches!(err, CompanionError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out() {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher.insert(&model_url(), b"slow".to_vec());
        fetcher.set_delay(&model_url(), Duration::from_secs(60));

        let context = LoadContext::new(
            fetcher,
            AssetResolver::new(model_url()),
            LoadTicket::detached(),
            1_000,
        );
        let err = context.fetch_model().await.unwrap_err();
        assert!(matches!(
            err,
            CompanionError::LoadTimeout {
                timeout_ms: 1_000,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_fetch_is_cancelled() {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher.insert(&model_url(), b"bytes".to_vec());
        fetcher.set_delay(&model_url(), Duration::from_millis(50));
        let sequencer = LoadSequencer::new();
        let context = LoadContext::new(
            fetcher.clone(),
            AssetResolver::new(model_url()),
            sequencer.issue(),
            1_000,
        );

        let pending = context.fetch_model();
        sequencer.issue();
        assert!(pending.await.unwrap_err().is_cancellation());
        assert_eq!(fetcher.fetch_count(&model_url()), 0);
    }
}
