// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error};
use serde::{Deserialize, Serialize};
use ssh2::Session;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordAuth {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
}

impl SshEndpoint {
    pub fn localhost(port: u16) -> Self {
        SshEndpoint {
            host: String::from("127.0.0.1"),
            port,
        }
    }
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Error, Debug)]
pub enum SshCommandError {
    #[error("ssh connection failed")]
    Connection(#[source] std::io::Error),
    #[error("ssh session creation failed")]
    Session(#[source] ssh2::Error),
    #[error("ssh handshake failed")]
    Handshake(#[source] ssh2::Error),
    #[error("ssh authentication failed")]
    Authentication(#[source] ssh2::Error),
    #[error("ssh channel session failed")]
    ChannelSession(#[source] ssh2::Error),
    #[error("ssh command failed")]
    Command(#[source] ssh2::Error),
    #[error("reading ssh command output failed")]
    Output(#[source] std::io::Error),
    #[error("retrieving exit status from ssh command failed")]
    ExitStatus(#[source] ssh2::Error),
    #[error("the exit code indicates failure: {0}")]
    NonZeroExitStatus(i32),
    #[error("failed to read file")]
    FileRead(#[source] std::io::Error),
    #[error("failed to write file")]
    FileWrite(#[source] std::io::Error),
    #[error("failed to read metadata")]
    FileMetadata(#[source] std::io::Error),
    #[error("scp send failed")]
    ScpSend(#[source] ssh2::Error),
    #[error("scp receive failed")]
    ScpRecv(#[source] ssh2::Error),
    #[error("scp write failed")]
    WriteAll(#[source] std::io::Error),
    #[error("scp send EOF failed")]
    SendEof(#[source] ssh2::Error),
    #[error("scp wait EOF failed")]
    WaitEof(#[source] ssh2::Error),
    #[error("ssh session is closed")]
    Closed,
}

/// An authenticated connection to a guest.
///
/// Implementations must allow [`RemoteSession::close`] to be called from a
/// thread other than the one running a command, which makes the in-flight
/// operation fail promptly.
pub trait RemoteSession: Send + Sync {
    /// Runs `command` in the guest. A foreground command is waited for and
    /// its standard output returned. A background command is detached from
    /// the session and an empty string is returned immediately.
    fn run_command(&self, command: &str, foreground: bool) -> Result<String, SshCommandError>;
    fn push_file(&self, local: &Path, remote: &Path) -> Result<(), SshCommandError>;
    fn pull_file(&self, remote: &Path, local: &Path) -> Result<(), SshCommandError>;
    fn close(&self);
}

/// Opens sessions to guests. A single attempt, bounded by `timeout`.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        endpoint: &SshEndpoint,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteSession>, SshCommandError>;
}

pub struct SshSession {
    endpoint: SshEndpoint,
    session: Mutex<Session>,
    tcp: TcpStream,
    closed: AtomicBool,
}

impl SshSession {
    pub fn connect(
        endpoint: &SshEndpoint,
        auth: &PasswordAuth,
        timeout: Duration,
    ) -> Result<Self, SshCommandError> {
        let addr = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(SshCommandError::Connection)?
            .next()
            .ok_or_else(|| {
                SshCommandError::Connection(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no address for {endpoint}"),
                ))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(SshCommandError::Connection)?;
        let transport = tcp.try_clone().map_err(SshCommandError::Connection)?;

        let mut sess = Session::new().map_err(SshCommandError::Session)?;
        sess.set_tcp_stream(transport);
        sess.set_timeout(timeout.as_millis().try_into().unwrap_or(u32::MAX));
        sess.handshake().map_err(SshCommandError::Handshake)?;
        sess.userauth_password(&auth.username, &auth.password)
            .map_err(SshCommandError::Authentication)?;
        // Handshake is bounded, commands are not: a benchmark step may
        // legitimately run for minutes.
        sess.set_timeout(0);

        debug!("SSH session established with {endpoint}");

        Ok(SshSession {
            endpoint: endpoint.clone(),
            session: Mutex::new(sess),
            tcp,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), SshCommandError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SshCommandError::Closed);
        }
        Ok(())
    }

    fn exec(&self, command: &str, output: &mut String) -> Result<(), SshCommandError> {
        self.check_open()?;
        let sess = self.session.lock().unwrap();
        let mut channel = sess
            .channel_session()
            .map_err(SshCommandError::ChannelSession)?;
        channel.exec(command).map_err(SshCommandError::Command)?;

        channel
            .read_to_string(output)
            .map_err(SshCommandError::Output)?;
        let mut stderr = String::new();
        // Only used for diagnostics
        let _ = channel.stderr().read_to_string(&mut stderr);
        output.push_str(&stderr);

        let _ = channel.close();
        let _ = channel.wait_close();

        let status = channel.exit_status().map_err(SshCommandError::ExitStatus)?;
        if status != 0 {
            return Err(SshCommandError::NonZeroExitStatus(status));
        }

        Ok(())
    }
}

impl RemoteSession for SshSession {
    fn run_command(&self, command: &str, foreground: bool) -> Result<String, SshCommandError> {
        let full_command = if foreground {
            command.to_string()
        } else {
            background_command(command)
        };

        let mut s = String::new();
        match self.exec(&full_command, &mut s) {
            Ok(()) if foreground => Ok(s),
            Ok(()) => Ok(String::new()),
            Err(e) => {
                error!(
                    "\n\n==== Start ssh command output (FAILED) ====\n\n\
                     command=\"{full_command}\"\n\
                     endpoint=\"{}\"\n\
                     output=\"{s}\"\n\
                     error=\"{e:?}\"\n\
                     \n==== End ssh command output ====\n\n",
                    self.endpoint
                );
                Err(e)
            }
        }
    }

    fn push_file(&self, local: &Path, remote: &Path) -> Result<(), SshCommandError> {
        self.check_open()?;
        let content = fs::read(local).map_err(SshCommandError::FileRead)?;
        let mode = fs::metadata(local)
            .map_err(SshCommandError::FileMetadata)?
            .permissions()
            .mode()
            & 0o777;

        let sess = self.session.lock().unwrap();
        let mut channel = sess
            .scp_send(remote, mode as i32, content.len() as u64, None)
            .map_err(SshCommandError::ScpSend)?;
        channel
            .write_all(&content)
            .map_err(SshCommandError::WriteAll)?;
        channel.send_eof().map_err(SshCommandError::SendEof)?;
        channel.wait_eof().map_err(SshCommandError::WaitEof)?;

        // Intentionally ignore these results here as their failure
        // does not invalidate the transfer
        let _ = channel.close();
        let _ = channel.wait_close();

        Ok(())
    }

    fn pull_file(&self, remote: &Path, local: &Path) -> Result<(), SshCommandError> {
        self.check_open()?;
        let sess = self.session.lock().unwrap();
        let (mut channel, stat) = sess.scp_recv(remote).map_err(SshCommandError::ScpRecv)?;

        let mut content = Vec::with_capacity(stat.size() as usize);
        channel
            .read_to_end(&mut content)
            .map_err(SshCommandError::FileRead)?;
        let _ = channel.send_eof();
        let _ = channel.wait_eof();
        let _ = channel.close();
        let _ = channel.wait_close();

        fs::write(local, content).map_err(SshCommandError::FileWrite)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing SSH session with {}", self.endpoint);
        // Shutting the socket down unblocks a thread stuck in a channel read
        let _ = self.tcp.shutdown(Shutdown::Both);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone, Debug)]
pub struct PasswordConnector {
    pub auth: PasswordAuth,
}

impl Connector for PasswordConnector {
    fn connect(
        &self,
        endpoint: &SshEndpoint,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteSession>, SshCommandError> {
        Ok(Arc::new(SshSession::connect(endpoint, &self.auth, timeout)?))
    }
}

/// Wraps `command` so it keeps running once the channel is closed.
fn background_command(command: &str) -> String {
    format!("nohup sh -c {} > /dev/null 2>&1 &", shell_quote(command))
}

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("fio a.cfg"), "'fio a.cfg'");
        assert_eq!(shell_quote("echo 'x'"), "'echo '\\''x'\\'''");
    }

    #[test]
    fn test_background_command() {
        assert_eq!(
            background_command("fio /root/fio_config.cfg > /root/result.json"),
            "nohup sh -c 'fio /root/fio_config.cfg > /root/result.json' > /dev/null 2>&1 &"
        );
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(SshEndpoint::localhost(6666).to_string(), "127.0.0.1:6666");
    }

    #[test]
    fn test_connect_refused() {
        // Grab a free port and release it so nothing listens there
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let auth = PasswordAuth {
            username: String::from("ubuntu"),
            password: String::from("asdfqwer"),
        };

        let r = SshSession::connect(
            &SshEndpoint::localhost(port),
            &auth,
            Duration::from_millis(500),
        );
        assert!(matches!(r, Err(SshCommandError::Connection(_))));
    }
}
