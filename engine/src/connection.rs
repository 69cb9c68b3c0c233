//! Remote endpoint sessions.
//!
//! `RemoteFs` is the set of operations the engine needs from an endpoint:
//! listing, size queries, streaming retrieve/store and directory creation.
//! `FtpConnection` implements it over a blocking `suppaftp` session; tests
//! use an in-memory implementation.
//!
//! A session is always in passive, binary mode. Whether the server supports
//! structured listings (`MLSD`) is asked once at login and remembered for
//! the lifetime of the session.
//!
//! The engine talks to endpoints through `Session`, which drops its
//! connection after a failed transfer and opens a new one on the next call.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tracing::{debug, info, warn};

use crate::config::{EndpointConfig, Timeouts};
use crate::error::EngineError;
use crate::listing::{parse_mlsd_line, parse_nlst_line, ListedEntry};
use crate::model::EntryKind;
use crate::paths::join_remote;
use crate::retry::{self, RetryPolicy, Sleeper};

/// Copy buffer size for data transfers.
pub const TRANSFER_BUFFER_SIZE: usize = 8 * 1024;

/// Operations on an authenticated remote session.
///
/// Paths are relative to the login directory. Every method may fail with a
/// retryable `EngineError::Transfer` when the transport misbehaves.
pub trait RemoteFs {
    /// True when `list` returns kind and size for every child.
    fn supports_structured_listing(&self) -> bool;

    /// True when `path` exists and is a directory.
    fn is_directory(&mut self, path: &str) -> Result<bool, EngineError>;

    /// Immediate children of `path`, in the order the server sent them.
    fn list(&mut self, path: &str) -> Result<Vec<ListedEntry>, EngineError>;

    /// Size of the file at `path`, or `None` when the server cannot tell.
    fn size(&mut self, path: &str) -> Result<Option<u64>, EngineError>;

    /// Stream the file at `path` into `sink`; returns the bytes received.
    fn retrieve(&mut self, path: &str, sink: &mut dyn Write) -> Result<u64, EngineError>;

    /// Stream `source` into the file at `path`; returns the bytes sent.
    fn store(&mut self, source: &mut dyn Read, path: &str) -> Result<u64, EngineError>;

    /// Create the directory `path`. Succeeds if it already exists.
    fn make_dir(&mut self, path: &str) -> Result<(), EngineError>;

    /// End the session politely.
    fn close(&mut self) -> Result<(), EngineError>;
}

/// Opens sessions to an endpoint.
pub trait Connector {
    type Connection: RemoteFs;

    /// One connection attempt: connect, authenticate, set session modes.
    fn connect(
        &self,
        endpoint: &EndpointConfig,
        timeouts: &Timeouts,
    ) -> Result<Self::Connection, EngineError>;
}

/// Open a session, retrying transient failures under `policy`.
///
/// # Errors
/// Returns the last `EngineError::Connect` once the policy gives up
pub fn open<C: Connector>(
    connector: &C,
    endpoint: &EndpointConfig,
    timeouts: &Timeouts,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
) -> Result<C::Connection, EngineError> {
    let label = format!("Connect to {}:{}", endpoint.host, endpoint.port);
    let conn = retry::run(policy, sleeper, &label, |_| {
        connector.connect(endpoint, timeouts)
    })?;
    info!("Connected to {}:{} as {}", endpoint.host, endpoint.port, endpoint.user);
    Ok(conn)
}

/// A connection to one endpoint that is replaced after a transfer failure.
///
/// A control channel that saw a reset is dead, and one whose data transfer
/// broke off may still hold a stale reply. Any `EngineError::Transfer`
/// therefore discards the connection; the next operation makes a single
/// connect attempt before running. Backoff is left to the caller's retry
/// loop, which sees a failed reconnect as a retryable `Connect` error.
pub struct Session<'a, C: Connector> {
    connector: &'a C,
    endpoint: &'a EndpointConfig,
    timeouts: &'a Timeouts,
    conn: Option<C::Connection>,
    structured_listing: bool,
    reconnects: u32,
}

impl<'a, C: Connector> Session<'a, C> {
    /// Open the first connection, retrying under `policy`.
    ///
    /// # Errors
    /// Returns the last `EngineError::Connect` once the policy gives up
    pub fn open(
        connector: &'a C,
        endpoint: &'a EndpointConfig,
        timeouts: &'a Timeouts,
        policy: &RetryPolicy,
        sleeper: &dyn Sleeper,
    ) -> Result<Self, EngineError> {
        let conn = open(connector, endpoint, timeouts, policy, sleeper)?;
        Ok(Session {
            connector,
            endpoint,
            timeouts,
            structured_listing: conn.supports_structured_listing(),
            conn: Some(conn),
            reconnects: 0,
        })
    }

    /// Connections opened after the first one.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    fn live(&mut self) -> Result<&mut C::Connection, EngineError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let conn = self.connector.connect(self.endpoint, self.timeouts)?;
                self.reconnects += 1;
                self.structured_listing = conn.supports_structured_listing();
                info!("Reconnected to {}:{}", self.endpoint.host, self.endpoint.port);
                conn
            }
        };
        Ok(self.conn.insert(conn))
    }

    fn call<T>(
        &mut self,
        op: impl FnOnce(&mut C::Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let result = op(self.live()?);
        if let Err(e @ EngineError::Transfer { .. }) = &result {
            warn!(
                "Dropping session to {}:{} after: {}",
                self.endpoint.host, self.endpoint.port, e
            );
            self.conn = None;
        }
        result
    }
}

impl<C: Connector> RemoteFs for Session<'_, C> {
    fn supports_structured_listing(&self) -> bool {
        self.structured_listing
    }

    fn is_directory(&mut self, path: &str) -> Result<bool, EngineError> {
        self.call(|conn| conn.is_directory(path))
    }

    fn list(&mut self, path: &str) -> Result<Vec<ListedEntry>, EngineError> {
        self.call(|conn| conn.list(path))
    }

    fn size(&mut self, path: &str) -> Result<Option<u64>, EngineError> {
        self.call(|conn| conn.size(path))
    }

    fn retrieve(&mut self, path: &str, sink: &mut dyn Write) -> Result<u64, EngineError> {
        self.call(|conn| conn.retrieve(path, sink))
    }

    fn store(&mut self, source: &mut dyn Read, path: &str) -> Result<u64, EngineError> {
        self.call(|conn| conn.store(source, path))
    }

    fn make_dir(&mut self, path: &str) -> Result<(), EngineError> {
        self.call(|conn| conn.make_dir(path))
    }

    /// Closes the current connection, if any; a dropped one is not revived.
    fn close(&mut self) -> Result<(), EngineError> {
        match self.conn.take() {
            Some(mut conn) => conn.close(),
            None => Ok(()),
        }
    }
}

/// Copy `reader` into `writer` through a fixed-size buffer.
pub fn copy_buffered(reader: &mut dyn Read, writer: &mut dyn Write) -> io::Result<u64> {
    let mut buf = [0u8; TRANSFER_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

/// Connects to FTP servers with `suppaftp`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FtpConnector;

impl Connector for FtpConnector {
    type Connection = FtpConnection;

    fn connect(
        &self,
        endpoint: &EndpointConfig,
        timeouts: &Timeouts,
    ) -> Result<FtpConnection, EngineError> {
        FtpConnection::connect(endpoint, timeouts)
    }
}

/// A live FTP session.
pub struct FtpConnection {
    stream: FtpStream,
    timeouts: Timeouts,
    /// Login directory; directory checks that change directory return here
    home: String,
    structured_listing: bool,
}

impl std::fmt::Debug for FtpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConnection")
            .field("home", &self.home)
            .field("structured_listing", &self.structured_listing)
            .finish()
    }
}

impl FtpConnection {
    /// Connect, log in, switch to passive binary mode, query features.
    ///
    /// # Errors
    /// Returns `EngineError::Connect` if any step fails
    pub fn connect(endpoint: &EndpointConfig, timeouts: &Timeouts) -> Result<Self, EngineError> {
        let connect_err = |reason: String| EngineError::Connect {
            host: endpoint.host.clone(),
            port: endpoint.port,
            reason,
        };

        let addr = resolve(&endpoint.host, endpoint.port).map_err(|e| connect_err(e.to_string()))?;
        let mut stream = FtpStream::connect_timeout(addr, timeouts.connect)
            .map_err(|e| connect_err(e.to_string()))?;

        let control = stream.get_ref();
        control
            .set_read_timeout(Some(timeouts.data))
            .and_then(|_| control.set_write_timeout(Some(timeouts.data)))
            .map_err(|e| connect_err(e.to_string()))?;

        stream
            .login(endpoint.user.as_str(), endpoint.password.as_str())
            .map_err(|e| connect_err(format!("login failed: {}", e)))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| connect_err(format!("cannot switch to binary mode: {}", e)))?;
        stream.set_mode(Mode::Passive);

        let home = stream.pwd().map_err(|e| connect_err(e.to_string()))?;

        let structured_listing = match stream.feat() {
            Ok(features) => features
                .keys()
                .any(|k| k.eq_ignore_ascii_case("MLST") || k.eq_ignore_ascii_case("MLSD")),
            Err(e) => {
                debug!("FEAT not supported by {}: {}", endpoint.host, e);
                false
            }
        };
        if !structured_listing {
            warn!(
                "{} does not support MLSD; falling back to NLST with per-file size queries",
                endpoint.host
            );
        }

        Ok(FtpConnection {
            stream,
            timeouts: *timeouts,
            home,
            structured_listing,
        })
    }

    fn return_home(&mut self, path: &str) -> Result<(), EngineError> {
        self.stream
            .cwd(self.home.as_str())
            .map_err(|e| EngineError::transfer(path, e))
    }
}

impl RemoteFs for FtpConnection {
    fn supports_structured_listing(&self) -> bool {
        self.structured_listing
    }

    fn is_directory(&mut self, path: &str) -> Result<bool, EngineError> {
        match self.stream.cwd(path) {
            Ok(()) => {
                self.return_home(path)?;
                Ok(true)
            }
            Err(FtpError::UnexpectedResponse(_)) => Ok(false),
            Err(e) => Err(EngineError::transfer(path, e)),
        }
    }

    fn list(&mut self, path: &str) -> Result<Vec<ListedEntry>, EngineError> {
        if self.structured_listing {
            let lines = self
                .stream
                .mlsd(Some(path))
                .map_err(|e| EngineError::transfer(path, e))?;
            return Ok(lines.iter().filter_map(|l| parse_mlsd_line(l)).collect());
        }

        let lines = match self.stream.nlst(Some(path)) {
            Ok(lines) => lines,
            // Many servers answer NLST on an empty directory with 450/550
            Err(FtpError::UnexpectedResponse(resp)) => {
                debug!("NLST {} returned {:?}; treating as empty", path, resp.status);
                Vec::new()
            }
            Err(e) => return Err(EngineError::transfer(path, e)),
        };

        let mut entries = Vec::with_capacity(lines.len());
        for line in &lines {
            let Some(name) = parse_nlst_line(line) else {
                continue;
            };
            let child = join_remote(path, name);
            let kind = if self.is_directory(&child)? {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            entries.push(ListedEntry {
                name: name.to_string(),
                kind,
                size: None,
                modified: None,
            });
        }
        Ok(entries)
    }

    fn size(&mut self, path: &str) -> Result<Option<u64>, EngineError> {
        match self.stream.size(path) {
            Ok(size) => Ok(Some(size as u64)),
            Err(FtpError::UnexpectedResponse(_)) => Ok(None),
            Err(e) => Err(EngineError::transfer(path, e)),
        }
    }

    fn retrieve(&mut self, path: &str, sink: &mut dyn Write) -> Result<u64, EngineError> {
        let mut data = self
            .stream
            .retr_as_stream(path)
            .map_err(|e| EngineError::transfer(path, e))?;
        data.get_ref()
            .set_read_timeout(Some(self.timeouts.data))
            .map_err(|e| EngineError::transfer(path, e))?;
        let received = match copy_buffered(&mut data, sink) {
            Ok(received) => received,
            Err(e) => {
                // Consume the 426/226 reply so it is not read as the next answer
                if let Err(abort) = self.stream.abort(data) {
                    debug!("ABOR after failed RETR {}: {}", path, abort);
                }
                return Err(EngineError::transfer(path, e));
            }
        };
        self.stream
            .finalize_retr_stream(data)
            .map_err(|e| EngineError::transfer(path, e))?;
        debug!("RETR {} ({} bytes)", path, received);
        Ok(received)
    }

    fn store(&mut self, source: &mut dyn Read, path: &str) -> Result<u64, EngineError> {
        let mut data = self
            .stream
            .put_with_stream(path)
            .map_err(|e| EngineError::transfer(path, e))?;
        data.get_ref()
            .set_write_timeout(Some(self.timeouts.data))
            .map_err(|e| EngineError::transfer(path, e))?;
        let sent = match copy_buffered(source, &mut data) {
            Ok(sent) => sent,
            Err(e) => {
                if let Err(abort) = self.stream.abort(data) {
                    debug!("ABOR after failed STOR {}: {}", path, abort);
                }
                return Err(EngineError::transfer(path, e));
            }
        };
        self.stream
            .finalize_put_stream(data)
            .map_err(|e| EngineError::transfer(path, e))?;
        debug!("STOR {} ({} bytes)", path, sent);
        Ok(sent)
    }

    fn make_dir(&mut self, path: &str) -> Result<(), EngineError> {
        match self.stream.mkdir(path) {
            Ok(()) => Ok(()),
            Err(FtpError::UnexpectedResponse(resp)) => {
                if self.is_directory(path)? {
                    Ok(())
                } else {
                    Err(EngineError::transfer(
                        path,
                        format!("MKD refused: {:?}", resp.status),
                    ))
                }
            }
            Err(e) => Err(EngineError::transfer(path, e)),
        }
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.stream
            .quit()
            .map_err(|e| EngineError::transfer(&self.home, e))
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {}", host),
        )
    })
}
