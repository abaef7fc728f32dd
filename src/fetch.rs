//! Fragment retrieval
//!
//! Rule results and class configurations are *fragment references*: a bare
//! relative path or a full location with a scheme. [`FragmentRef::resolve`]
//! turns a reference into a [`Location`] relative to the document that
//! mentioned it; a [`FragmentFetcher`] turns a location into bytes.
//!
//! | Scheme           | Retrieved via |
//! |------------------|---------------|
//! | `file`           | local filesystem |
//! | `http`, `https`  | blocking reqwest client |
//! | `ftp`, `tftp`    | `curl` |
//! | `relurl`         | relative to the active profile location |
//! | `floppy`, `usb`  | first configured media root containing the path |
//! | `slp`            | `slptool findsrvs service:autoyast`, then the announced URL |

use crate::command_runner;
use crate::error::{AutoinstError, Result};
use crate::types::Scheme;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

// ============================================================================
// Locations
// ============================================================================

/// A parsed profile location: `scheme://host/path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub scheme: Scheme,
    pub host: String,
    pub path: String,
}

impl Location {
    pub fn new(scheme: Scheme, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme,
            host: host.into(),
            path: path.into(),
        }
    }

    /// Parse a location string.
    ///
    /// Strings without a scheme are local files; `slp` on its own asks for
    /// service discovery.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AutoinstError::fetch(text, "empty profile location"));
        }
        if text == "slp" {
            return Ok(Self::new(Scheme::Slp, "", ""));
        }

        let Some((scheme, rest)) = text.split_once("://") else {
            return Ok(Self::new(Scheme::File, "", text));
        };
        let scheme = Scheme::from_str(&scheme.to_ascii_lowercase())
            .map_err(|_| AutoinstError::fetch(text, format!("unsupported scheme {:?}", scheme)))?;

        let location = match scheme {
            // Everything after the separator is a path
            Scheme::File | Scheme::Relurl | Scheme::Floppy | Scheme::Usb | Scheme::Slp => {
                Self::new(scheme, "", rest)
            }
            _ => match rest.find('/') {
                Some(slash) => Self::new(scheme, &rest[..slash], &rest[slash..]),
                None => Self::new(scheme, rest, "/"),
            },
        };
        Ok(location)
    }

    /// Directory part of the path, with a trailing slash.
    pub fn dir(&self) -> Self {
        let dir = match self.path.rfind('/') {
            Some(slash) => self.path[..=slash].to_string(),
            None => String::new(),
        };
        Self::new(self.scheme, self.host.clone(), dir)
    }

    /// This location taken as a directory: a trailing slash is added when
    /// missing, so `join` resolves below it instead of next to it.
    pub fn as_dir(&self) -> Self {
        if self.path.is_empty() || self.path.ends_with('/') {
            return self.clone();
        }
        Self::new(self.scheme, self.host.clone(), format!("{}/", self.path))
    }

    /// Resolve `relative` against this location's directory.
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_start_matches("./");
        if relative.starts_with('/') {
            return Self::new(self.scheme, self.host.clone(), relative);
        }
        let dir = self.dir();
        Self::new(self.scheme, dir.host, format!("{}{}", dir.path, relative))
    }

    /// URL form used by network clients.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Slp if self.path.is_empty() => write!(f, "slp"),
            _ => write!(f, "{}", self.url()),
        }
    }
}

impl FromStr for Location {
    type Err = AutoinstError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Opaque reference to a profile fragment, as written in a rule result or a
/// class definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentRef(String);

impl FragmentRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Location of the fragment, relative references resolved against `base`.
    ///
    /// `relurl://x` and bare paths are relative; any other scheme is absolute.
    pub fn resolve(&self, base: &Location) -> Result<Location> {
        if !self.0.contains("://") {
            return Ok(base.join(&self.0));
        }
        let location = Location::parse(&self.0)?;
        if location.scheme == Scheme::Relurl {
            Ok(base.join(&location.path))
        } else {
            Ok(location)
        }
    }
}

impl fmt::Display for FragmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Fetchers
// ============================================================================

/// Retrieves the bytes behind a location.
pub trait FragmentFetcher {
    fn fetch(&self, location: &Location) -> Result<Vec<u8>>;

    /// Retrieve into a file, for collaborators that work on paths.
    fn fetch_to(&self, location: &Location, destination: &Path) -> Result<()> {
        let bytes = self.fetch(location)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(destination, bytes)?;
        Ok(())
    }

    /// Called when a run attempt starts from `location`.
    fn set_profile_location(&self, _location: &Location) {}
}

/// Fetcher for every supported scheme.
#[derive(Debug, Clone)]
pub struct DefaultFetcher {
    /// Mount points searched for `floppy`/`usb` locations
    pub media_roots: Vec<PathBuf>,
    /// Active profile location, base of `relurl` locations
    relurl_base: RefCell<Option<Location>>,
}

impl DefaultFetcher {
    pub fn new(media_roots: Vec<PathBuf>) -> Self {
        Self {
            media_roots,
            relurl_base: RefCell::new(None),
        }
    }

    pub fn with_relurl_base(self, base: Location) -> Self {
        self.relurl_base.replace(Some(base));
        self
    }

    pub fn relurl_base(&self) -> Option<Location> {
        self.relurl_base.borrow().clone()
    }

    fn fetch_file(&self, location: &Location) -> Result<Vec<u8>> {
        fs::read(&location.path).map_err(|e| AutoinstError::fetch(location.to_string(), e.to_string()))
    }

    fn fetch_http(&self, location: &Location) -> Result<Vec<u8>> {
        let url = location.url();
        let response = reqwest::blocking::get(&url)
            .and_then(|r| r.error_for_status())
            .map_err(|e| AutoinstError::fetch(&url, e.to_string()))?;
        let bytes = response
            .bytes()
            .map_err(|e| AutoinstError::fetch(&url, e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn fetch_curl(&self, location: &Location) -> Result<Vec<u8>> {
        let url = location.url();
        let args = ["--fail", "--silent", "--show-error", "--location", url.as_str()]
            .map(String::from);
        let output = command_runner::run_command("curl", &args)
            .map_err(|e| AutoinstError::fetch(&url, format!("{:#}", e)))?;
        output
            .ensure_success("curl")
            .map_err(|e| AutoinstError::fetch(&url, format!("{:#}", e)))?;
        Ok(output.stdout.into_bytes())
    }

    fn fetch_media(&self, location: &Location) -> Result<Vec<u8>> {
        let relative = location.path.trim_start_matches('/');
        for root in &self.media_roots {
            let candidate = root.join(relative);
            if candidate.is_file() {
                debug!("Found {} on removable media at {}", location, candidate.display());
                return fs::read(&candidate)
                    .map_err(|e| AutoinstError::fetch(location.to_string(), e.to_string()));
            }
        }
        Err(AutoinstError::fetch(
            location.to_string(),
            format!("not found below any of {} media roots", self.media_roots.len()),
        ))
    }

    fn fetch_slp(&self, location: &Location) -> Result<Vec<u8>> {
        let args = ["findsrvs", "service:autoyast"].map(String::from);
        let output = command_runner::run_command("slptool", &args)
            .map_err(|e| AutoinstError::fetch(location.to_string(), format!("{:#}", e)))?;
        let announced = parse_slp_output(&output.stdout).ok_or_else(|| {
            AutoinstError::fetch(location.to_string(), "no service:autoyast announcement found")
        })?;
        info!("SLP announced profile location {}", announced);

        let target = Location::parse(&announced)?;
        if target.scheme == Scheme::Slp {
            return Err(AutoinstError::fetch(announced, "SLP announced another SLP location"));
        }
        // A bare `slp` asks for the announced profile; `slp://x` for a file next to it
        let target = if location.path.is_empty() {
            target
        } else {
            target.join(&location.path)
        };
        self.fetch(&target)
    }
}

impl FragmentFetcher for DefaultFetcher {
    fn fetch(&self, location: &Location) -> Result<Vec<u8>> {
        debug!("Fetching {}", location);
        match location.scheme {
            Scheme::File => self.fetch_file(location),
            Scheme::Http | Scheme::Https => self.fetch_http(location),
            Scheme::Ftp | Scheme::Tftp => self.fetch_curl(location),
            Scheme::Floppy | Scheme::Usb => self.fetch_media(location),
            Scheme::Slp => self.fetch_slp(location),
            Scheme::Relurl => {
                let base = self.relurl_base().ok_or_else(|| {
                    AutoinstError::fetch(location.to_string(), "relurl without an active profile location")
                })?;
                let resolved = base.join(&location.path);
                if resolved.scheme == Scheme::Relurl {
                    return Err(AutoinstError::fetch(location.to_string(), "relurl base is itself relative"));
                }
                self.fetch(&resolved)
            }
        }
    }

    /// A relative location never replaces the base it is resolved against.
    fn set_profile_location(&self, location: &Location) {
        if location.scheme != Scheme::Relurl {
            self.relurl_base.replace(Some(location.as_dir()));
        }
    }
}

/// First URL of `slptool findsrvs` output
/// (`service:autoyast:http://host/path,65535`).
pub fn parse_slp_output(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let url = line.trim().strip_prefix("service:autoyast:")?;
        let url = url.split(',').next()?.trim();
        (!url.is_empty()).then(|| url.to_string())
    })
}

/// In-memory fetcher keyed by location string.
///
/// Records every requested location, which lets callers assert on retrieval
/// order and retries.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    entries: BTreeMap<String, Vec<u8>>,
    requests: RefCell<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, location: &str, content: impl Into<Vec<u8>>) -> Self {
        self.insert(location, content);
        self
    }

    pub fn insert(&mut self, location: &str, content: impl Into<Vec<u8>>) {
        let key = Location::parse(location)
            .map(|l| l.to_string())
            .unwrap_or_else(|_| location.to_string());
        self.entries.insert(key, content.into());
    }

    /// Locations requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

impl FragmentFetcher for MemoryFetcher {
    fn fetch(&self, location: &Location) -> Result<Vec<u8>> {
        let key = location.to_string();
        self.requests.borrow_mut().push(key.clone());
        self.entries
            .get(&key)
            .cloned()
            .ok_or_else(|| AutoinstError::fetch(key, "not found"))
    }
}
