//! Remote file I/O commands (`fopen`, `fread`, `fwrite`, `fclose`).
//!
//! The packager can ask the app to open, read, write and close files. Open
//! handles are identified by small integer ids and closed automatically
//! once idle for longer than [`FILE_IDLE_TIMEOUT`]; the check runs lazily on
//! each command.
//!
//! File names are resolved against a root directory and may not escape it.
//! File contents travel base64-encoded in both directions, so binary files
//! such as heap captures survive the JSON transport unchanged.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use packlink_core::prelude::*;

use crate::connection::PackagerConnection;
use crate::dispatch::{RequestHandler, Responder};
use crate::protocol::PackagerMethod;

/// Idle time after which an open file is closed.
pub const FILE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// The methods served by [`FileIoHandler`].
pub const FILE_IO_METHODS: [PackagerMethod; 4] = [
    PackagerMethod::FileOpen,
    PackagerMethod::FileRead,
    PackagerMethod::FileWrite,
    PackagerMethod::FileClose,
];

#[derive(Debug, Deserialize)]
struct OpenParams {
    filename: String,
    mode: String,
}

#[derive(Debug, Deserialize)]
struct ReadParams {
    file: u64,
    size: usize,
}

#[derive(Debug, Deserialize)]
struct WriteParams {
    file: u64,
    /// Base64-encoded bytes.
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CloseParams {
    Object { file: u64 },
    Id(u64),
}

impl CloseParams {
    fn id(&self) -> u64 {
        match self {
            CloseParams::Object { file } | CloseParams::Id(file) => *file,
        }
    }
}

#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    file: File,
    last_used: Instant,
}

#[derive(Debug, Default)]
struct FileTable {
    next_id: u64,
    files: HashMap<u64, OpenFile>,
}

/// Serves the remote file I/O commands.
#[derive(Debug)]
pub struct FileIoHandler {
    root: PathBuf,
    idle_timeout: Duration,
    table: Mutex<FileTable>,
}

impl FileIoHandler {
    /// Create a handler resolving file names against `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            idle_timeout: FILE_IDLE_TIMEOUT,
            table: Mutex::new(FileTable::default()),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Install request handlers for all four file methods on `connection`.
    pub fn register(self: &Arc<Self>, connection: &PackagerConnection) {
        for method in FILE_IO_METHODS {
            connection.register_request_handler(
                method.clone(),
                FileIoCommand {
                    io: Arc::clone(self),
                    method,
                },
            );
        }
    }

    /// Execute one file command and return its result value.
    pub async fn call(&self, method: &PackagerMethod, params: Option<Value>) -> Result<Value> {
        let params = params.unwrap_or(Value::Null);
        let mut table = self.table.lock().await;
        self.close_idle(&mut table);

        match method {
            PackagerMethod::FileOpen => {
                let params: OpenParams = parse_params(method, params)?;
                let id = self.open(&mut table, &params).await?;
                Ok(Value::from(id))
            }
            PackagerMethod::FileRead => {
                let params: ReadParams = parse_params(method, params)?;
                let entry = lookup(&mut table, method, params.file)?;
                let mut buf = Vec::with_capacity(params.size.min(64 * 1024));
                (&mut entry.file)
                    .take(params.size as u64)
                    .read_to_end(&mut buf)
                    .await?;
                Ok(Value::String(STANDARD.encode(&buf)))
            }
            PackagerMethod::FileWrite => {
                let params: WriteParams = parse_params(method, params)?;
                let bytes = STANDARD.decode(params.data.as_bytes()).map_err(|e| {
                    Error::handler_failure(method.as_str(), format!("data is not valid base64: {e}"))
                })?;
                let entry = lookup(&mut table, method, params.file)?;
                entry.file.write_all(&bytes).await?;
                entry.file.flush().await?;
                Ok(Value::from(bytes.len()))
            }
            PackagerMethod::FileClose => {
                let params: CloseParams = parse_params(method, params)?;
                let id = params.id();
                let mut entry = table.files.remove(&id).ok_or_else(|| unknown_file(method, id))?;
                entry.file.flush().await?;
                debug!("Closed file #{} ({})", id, entry.path.display());
                Ok(Value::Null)
            }
            other => Err(Error::method_not_found(other.as_str())),
        }
    }

    /// Number of files currently open.
    pub async fn open_count(&self) -> usize {
        self.table.lock().await.files.len()
    }

    async fn open(&self, table: &mut FileTable, params: &OpenParams) -> Result<u64> {
        let path = self.resolve(&params.filename)?;

        let mut options = OpenOptions::new();
        match params.mode.as_str() {
            "r" => options.read(true),
            "w" => options.write(true).create(true).truncate(true),
            "a" => options.append(true).create(true),
            other => {
                return Err(Error::handler_failure(
                    PackagerMethod::FileOpen.as_str(),
                    format!("unsupported mode '{other}', expected r, w or a"),
                ))
            }
        };

        let file = options.open(&path).await?;
        table.next_id += 1;
        let id = table.next_id;
        debug!("Opened file #{} ({}, mode {})", id, path.display(), params.mode);
        table.files.insert(
            id,
            OpenFile {
                path,
                file,
                last_used: Instant::now(),
            },
        );
        Ok(id)
    }

    fn resolve(&self, filename: &str) -> Result<PathBuf> {
        let relative = Path::new(filename);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if filename.is_empty() || escapes {
            return Err(Error::handler_failure(
                PackagerMethod::FileOpen.as_str(),
                format!("file name '{filename}' must be relative and stay inside the root"),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn close_idle(&self, table: &mut FileTable) {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        table.files.retain(|id, entry| {
            let keep = now.duration_since(entry.last_used) < idle_timeout;
            if !keep {
                info!("Closing idle file #{} ({})", id, entry.path.display());
            }
            keep
        });
    }
}

fn lookup<'a>(table: &'a mut FileTable, method: &PackagerMethod, id: u64) -> Result<&'a mut OpenFile> {
    let entry = table
        .files
        .get_mut(&id)
        .ok_or_else(|| unknown_file(method, id))?;
    entry.last_used = Instant::now();
    Ok(entry)
}

fn unknown_file(method: &PackagerMethod, id: u64) -> Error {
    Error::handler_failure(method.as_str(), format!("unknown file id {id}"))
}

fn parse_params<T: serde::de::DeserializeOwned>(method: &PackagerMethod, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| Error::handler_failure(method.as_str(), format!("invalid params: {e}")))
}

/// One registered file method; runs the command on a task so the dispatch
/// worker is not held up by file I/O.
struct FileIoCommand {
    io: Arc<FileIoHandler>,
    method: PackagerMethod,
}

impl RequestHandler for FileIoCommand {
    fn on_request(&self, params: Option<Value>, responder: Responder) -> Result<()> {
        let io = Arc::clone(&self.io);
        let method = self.method.clone();
        tokio::spawn(async move {
            let sent = match io.call(&method, params).await {
                Ok(result) => responder.respond(result),
                Err(e) => {
                    warn!("{} #{} failed: {}", method, responder.id(), e);
                    responder.error(e.to_string())
                }
            };
            if let Err(e) = sent {
                debug!("Could not send {} response: {}", method, e);
            }
        });
        Ok(())
    }
}
