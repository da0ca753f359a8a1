//! Launcher error types.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Launcher error carrying a kind and a small key/value payload.
///
/// Serializable so that failures can travel inside [`crate::LauncherEvent`]s.
#[derive(Debug, Clone)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Settings could not be read, parsed or written
    Config,
    /// File system error outside of a specific pipeline step
    Io,
    /// Release feed unreachable or returned a bad response
    Network,
    /// Transport, HTTP or disk failure while transferring an artifact
    Download,
    /// Archive unreadable or an entry could not be written
    Extract,
    /// Moving staged content into the install directory failed
    Deploy,
    /// The managed application could not be started
    Start,
    /// Process control failure (signals, tool spawning)
    Process,
    /// Another live launcher instance holds the lock
    Lock,
    /// An update cycle is already running
    Busy,
    /// General error
    Other,
}

impl ErrorKind {
    /// Short description used as the prefix of the error message.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Config => "settings error",
            Self::Io => "file system error",
            Self::Network => "release feed error",
            Self::Download => "download failed",
            Self::Extract => "extraction failed",
            Self::Deploy => "deploy failed",
            Self::Start => "start failed",
            Self::Process => "process control failed",
            Self::Lock => "launcher lock unavailable",
            Self::Busy => "an update is already in progress",
            Self::Other => "error",
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Config => 1001,
            Self::Io => 1002,
            Self::Network => 2001,
            Self::Download => 2002,
            Self::Extract => 3001,
            Self::Deploy => 3002,
            Self::Start => 4001,
            Self::Process => 4002,
            Self::Lock => 5001,
            Self::Busy => 5002,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    fn with_url(kind: ErrorKind, url: &str, detail: impl Into<String>) -> Self {
        let mut err = Self::with_detail(kind, detail);
        err.payload.insert("url".to_string(), url.to_string());
        err
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn network_with_url(url: &str, detail: impl Into<String>) -> Self {
        Self::with_url(ErrorKind::Network, url, detail)
    }

    pub fn download(url: &str, detail: impl Into<String>) -> Self {
        Self::with_url(ErrorKind::Download, url, detail)
    }

    pub fn extract(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Extract, message)
    }

    pub fn deploy(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Deploy, message)
    }

    pub fn start(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Start, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn lock_held(pid: u32) -> Self {
        Self::new(
            ErrorKind::Lock,
            HashMap::from([("pid".to_string(), pid.to_string())]),
        )
    }

    pub fn lock(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Lock, message)
    }

    pub fn busy() -> Self {
        Self::new(ErrorKind::Busy, HashMap::new())
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Look up a payload value, e.g. `"detail"` or `"url"`.
    pub fn payload_value(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    /// Re-tag an error raised by a shared helper as belonging to a pipeline step.
    ///
    /// The payload is kept; the original kind is recorded under `"cause"`.
    pub fn into_kind(mut self, kind: ErrorKind) -> Self {
        if self.kind != kind {
            self.payload
                .insert("cause".to_string(), format!("{:?}", self.kind));
            self.kind = kind;
        }
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.label())?;
        if !self.payload.is_empty() {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            pairs.sort();
            write!(f, ": {}", pairs.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 3)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::extract(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
