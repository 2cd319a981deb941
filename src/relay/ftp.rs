//! FTP relay backend.

use std::collections::HashSet;
use std::io::Cursor;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use suppaftp::types::FileType;
use suppaftp::FtpStream;

use super::{RelayConnection, RelayConnector, RelayError};

/// Credentials and endpoint of the FTP sink.
#[derive(Clone)]
pub struct FtpConnector {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for FtpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl RelayConnector for FtpConnector {
    fn open(&self) -> Result<Box<dyn RelayConnection>, RelayError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| RelayError::Connect(format!("resolve {}: {}", self.host, e)))?
            .next()
            .ok_or_else(|| RelayError::Connect(format!("{} did not resolve", self.host)))?;

        let control = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        // Set before the greeting is read: a stalled server must fail the
        // command instead of pinning a relay thread.
        control
            .set_read_timeout(Some(self.timeout))
            .and_then(|()| control.set_write_timeout(Some(self.timeout)))
            .map_err(|e| RelayError::Connect(format!("set socket timeouts: {}", e)))?;
        let mut stream = FtpStream::connect_with_stream(control)
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        stream
            .login(self.username.as_str(), self.password.as_str())
            .map_err(|e| RelayError::Connect(format!("login as {}: {}", self.username, e)))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| RelayError::Connect(e.to_string()))?;

        Ok(Box::new(FtpConnection {
            stream: Some(stream),
        }))
    }

    fn describe(&self) -> String {
        format!("ftp://{}@{}:{}", self.username, self.host, self.port)
    }
}

struct FtpConnection {
    stream: Option<FtpStream>,
}

impl FtpConnection {
    fn stream(&mut self) -> Result<&mut FtpStream, RelayError> {
        self.stream.as_mut().ok_or(RelayError::NotConnected)
    }
}

impl RelayConnection for FtpConnection {
    fn list(&mut self, remote_path: &str) -> Result<HashSet<String>, RelayError> {
        let entries = self
            .stream()?
            .nlst(Some(remote_path))
            .map_err(|e| RelayError::List {
                path: remote_path.to_string(),
                reason: e.to_string(),
            })?;
        // Some servers answer NLST with full paths.
        Ok(entries
            .into_iter()
            .filter_map(|entry| entry.rsplit('/').next().map(str::to_string))
            .filter(|name| !name.is_empty())
            .collect())
    }

    fn upload(&mut self, remote_path: &str, name: &str, bytes: &[u8]) -> Result<(), RelayError> {
        let upload_error = |reason: String| RelayError::Upload {
            name: name.to_string(),
            reason,
        };
        let stream = self.stream()?;
        stream
            .cwd(remote_path)
            .map_err(|e| upload_error(format!("cwd {}: {}", remote_path, e)))?;
        let mut reader = Cursor::new(bytes);
        stream
            .put_file(name, &mut reader)
            .map_err(|e| upload_error(e.to_string()))?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.quit() {
                log::error!("relay: error while disconnecting from FTP: {}", e);
            }
        }
    }
}

impl Drop for FtpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        // Accept and never send a greeting.
        let server = std::thread::spawn(move || listener.accept().map(|(socket, _)| socket));

        let connector = FtpConnector {
            host: "127.0.0.1".to_string(),
            port,
            username: "camera".to_string(),
            password: "secret".to_string(),
            timeout: Duration::from_millis(300),
        };
        let started = Instant::now();
        assert!(matches!(connector.open(), Err(RelayError::Connect(_))));
        assert!(started.elapsed() < Duration::from_secs(3));

        drop(server.join().expect("join"));
    }

    #[test]
    fn debug_output_hides_password() {
        let connector = FtpConnector {
            host: "ftp.example.net".to_string(),
            port: 21,
            username: "camera".to_string(),
            password: "secret".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(!format!("{:?}", connector).contains("secret"));
    }
}
