//! client side of the wire protocol

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::ops::{Executor, Operation, Outcome};
use crate::transport::archive::{ArchiveRequest, ImportSummary};
use crate::transport::protocol::{self, Request, Response};
use crate::transport::Remote;

/// store name a server selects when the client names none
pub const DEFAULT_STORE: &str = "default";

struct Connection {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

impl Connection {
    fn request(&mut self, request: &Request) -> Result<Response> {
        protocol::send(&mut self.writer, request)?;
        protocol::expect(&mut self.reader)
    }
}

/// a store behind `hive serve`, reached over any pair of byte streams
pub struct RemoteStore {
    conn: Mutex<Connection>,
    child: Option<Child>,
}

impl RemoteStore {
    /// speak the protocol over `reader`/`writer` and select `store`
    pub fn from_streams<R, W>(reader: R, writer: W, store: &str) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let mut conn = Connection {
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(BufWriter::new(writer)),
        };
        match conn.request(&Request::Open {
            store: store.to_string(),
        })? {
            Response::Ready => {}
            other => return Err(unexpected(other)),
        }
        Ok(Self {
            conn: Mutex::new(conn),
            child: None,
        })
    }

    /// connect to `ssh://[user@]host[:port]/path` by running `hive serve` there
    pub fn ssh(url: &str) -> Result<Self> {
        let target = SshTarget::parse(url)?;
        let mut cmd = Command::new("ssh");
        if let Some(user) = &target.user {
            cmd.arg("-l").arg(user);
        }
        if let Some(port) = target.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(&target.host);
        cmd.arg(target.serve_command());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::transport(format!("failed to spawn ssh: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("stdout not available"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("stdin not available"))?;
        debug!(host = %target.host, path = %target.path, "ssh connection started");

        match Self::from_streams(stdout, stdin, DEFAULT_STORE) {
            Ok(mut remote) => {
                remote.child = Some(child);
                Ok(remote)
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        let _ = protocol::send(&mut self.conn.get_mut().writer, &Request::Quit);
        if let Some(child) = &mut self.child {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Executor for RemoteStore {
    fn execute(&self, op: Operation) -> Result<Outcome> {
        match self.conn.lock().request(&Request::Execute(op))? {
            Response::Outcome(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }
}

impl Remote for RemoteStore {
    fn upload(&self, archive: &Path) -> Result<ImportSummary> {
        let mut file = File::open(archive).with_path(archive)?;
        let mut conn = self.conn.lock();
        protocol::send(&mut conn.writer, &Request::Upload)?;
        protocol::send_stream(&mut conn.writer, &mut file)?;
        match protocol::expect(&mut conn.reader)? {
            Response::Imported(summary) => Ok(summary),
            other => Err(unexpected(other)),
        }
    }

    fn download(&self, request: &ArchiveRequest, dest: &Path) -> Result<u64> {
        let mut conn = self.conn.lock();
        let size = match conn.request(&Request::Download(request.clone()))? {
            Response::Archive { size } => size,
            other => return Err(unexpected(other)),
        };
        let mut file = File::create(dest).with_path(dest)?;
        let received = protocol::receive_stream(&mut conn.reader, &mut file)?;
        if received != size {
            return Err(Error::transport(format!(
                "archive announced {} bytes, received {}",
                size, received
            )));
        }
        file.sync_all().with_path(dest)?;
        Ok(received)
    }
}

/// remote failures surface with their kind; anything else breaks the protocol
fn unexpected(response: Response) -> Error {
    match response {
        Response::Failed { kind, message } => Error::Remote { kind, message },
        other => Error::transport(format!("unexpected response: {:?}", other)),
    }
}

#[derive(Debug, PartialEq, Eq)]
struct SshTarget {
    user: Option<String>,
    host: String,
    port: Option<u16>,
    path: String,
}

impl SshTarget {
    fn parse(url: &str) -> Result<Self> {
        let bad = || Error::transport(format!("invalid ssh url: {}", url));
        let rest = url.strip_prefix("ssh://").ok_or_else(bad)?;
        let (authority, path) = rest.split_once('/').ok_or_else(bad)?;
        let (user, hostport) = match authority.split_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, authority),
        };
        let (host, port) = match hostport.split_once(':') {
            Some((host, port)) => (host, Some(port.parse().map_err(|_| bad())?)),
            None => (hostport, None),
        };
        // a leading dash would reach ssh as an option
        if host.is_empty() || host.starts_with('-') || path.is_empty() {
            return Err(bad());
        }
        if user.as_deref().is_some_and(|u| u.is_empty() || u.starts_with('-')) {
            return Err(bad());
        }
        Ok(SshTarget {
            user,
            host: host.to_string(),
            port,
            path: format!("/{}", path),
        })
    }

    /// the command line the remote shell runs
    fn serve_command(&self) -> String {
        format!("hive --store {} serve", shell_quote(&self.path))
    }
}

/// single-quote `s` for a POSIX shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssh_url() {
        assert_eq!(
            SshTarget::parse("ssh://builder@cache.lan:2222/srv/hive").unwrap(),
            SshTarget {
                user: Some("builder".into()),
                host: "cache.lan".into(),
                port: Some(2222),
                path: "/srv/hive".into(),
            }
        );
        let plain = SshTarget::parse("ssh://cache/data").unwrap();
        assert_eq!(plain.user, None);
        assert_eq!(plain.port, None);
        assert_eq!(plain.path, "/data");
    }

    #[test]
    fn test_parse_ssh_url_rejects() {
        for url in [
            "cache:/srv",
            "ssh://cache",
            "ssh:///srv",
            "ssh://h:port/x",
            "ssh://-oProxyCommand=x/srv",
            "ssh://-l@h/srv",
            "ssh://@h/srv",
        ] {
            assert!(SshTarget::parse(url).is_err(), "{}", url);
        }
    }

    #[test]
    fn test_serve_command_quotes_path() {
        let target = SshTarget::parse("ssh://h/srv/it's; rm -rf x").unwrap();
        assert_eq!(
            target.serve_command(),
            "hive --store '/srv/it'\\''s; rm -rf x' serve"
        );
        assert_eq!(
            SshTarget::parse("ssh://h/srv/hive").unwrap().serve_command(),
            "hive --store '/srv/hive' serve"
        );
    }

    #[test]
    fn test_failed_becomes_remote_error() {
        let err = unexpected(Response::Failed {
            kind: crate::error::ErrorKind::Conflict,
            message: "manifest already exists: a:1".into(),
        });
        assert!(matches!(err, Error::Remote { kind: crate::error::ErrorKind::Conflict, .. }));
        assert_eq!(unexpected(Response::Ready).kind(), crate::error::ErrorKind::Transport);
    }
}
