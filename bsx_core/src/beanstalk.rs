//! Beanstalkd Stats Client
//!
//! Speaks the three read-only commands the exporter needs: `stats`,
//! `list-tubes` and `stats-tube <tube>`. Every reply has the shape
//!
//! ```text
//! OK <bytes>\r\n
//! <YAML body of <bytes> length>\r\n
//! ```
//!
//! or a single error word such as `NOT_FOUND`.

use std::collections::BTreeMap;
use std::io;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use serde_yaml::Value;

use crate::config::ExporterConfig;
use crate::error::{ExporterError, Result};
use crate::lazy_conn::{ConnectionState, Dialer, LazyConn, TcpDialer};

/// Key/value statistics exactly as the server reported them.
pub type StatMap = BTreeMap<String, String>;

const MAX_LINE_LEN: usize = 1024;
/// Upper bound on an `OK <bytes>` body. Real stats replies are a few KiB;
/// the list of tubes grows with the tube count.
const MAX_BODY_LEN: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 4096;

const ERROR_REPLIES: &[&str] = &[
    "NOT_FOUND",
    "BAD_FORMAT",
    "INTERNAL_ERROR",
    "OUT_OF_MEMORY",
    "UNKNOWN_COMMAND",
    "DRAINING",
];

/// The queue server as seen by the scrape loop.
#[async_trait]
pub trait QueueClient: Send + 'static {
    /// Server address, exported as the `instance` label.
    fn address(&self) -> &str;

    /// Make sure a connection is up, dialing once if needed.
    async fn connect(&mut self) -> io::Result<()>;

    /// Drop the connection so the next request starts on a fresh one.
    async fn disconnect(&mut self);

    async fn stats(&mut self) -> Result<StatMap>;

    async fn list_tubes(&mut self) -> Result<Vec<String>>;

    async fn tube_stats(&mut self, tube: &str) -> Result<StatMap>;
}

/// Beanstalkd client running over a [`LazyConn`].
pub struct BeanstalkClient<D: Dialer> {
    conn: LazyConn<D>,
    buf: BytesMut,
}

impl BeanstalkClient<TcpDialer> {
    /// Lazy TCP client for the configured server. Nothing is dialed until
    /// the first request.
    pub fn from_config(config: &ExporterConfig) -> Self {
        let dialer = TcpDialer::new(config.address.clone(), config.dial_timeout);
        Self::new(LazyConn::new(dialer, config.read_timeout))
    }
}

impl<D: Dialer> BeanstalkClient<D> {
    pub fn new(conn: LazyConn<D>) -> Self {
        Self {
            conn,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self
            .conn
            .read(&mut chunk)
            .await
            .map_err(ExporterError::Connection)?;
        if n == 0 {
            return Err(ExporterError::Connection(io::Error::from(
                io::ErrorKind::UnexpectedEof,
            )));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    async fn read_line(&mut self, command: &str) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.buf.len() > MAX_LINE_LEN {
                return Err(ExporterError::UnexpectedResponse {
                    command: command.to_string(),
                    response: String::from_utf8_lossy(&self.buf[..MAX_LINE_LEN]).into_owned(),
                });
            }
            self.fill().await?;
        }
    }

    async fn read_body(&mut self, command: &str, len: usize) -> Result<Vec<u8>> {
        let framed = match len.checked_add(2) {
            Some(framed) if len <= MAX_BODY_LEN => framed,
            _ => {
                return Err(ExporterError::UnexpectedResponse {
                    command: command.to_string(),
                    response: format!("body of {len} bytes exceeds limit of {MAX_BODY_LEN}"),
                })
            }
        };
        while self.buf.len() < framed {
            self.fill().await?;
        }
        let body = self.buf.split_to(len);
        if &self.buf[..2] != b"\r\n" {
            return Err(ExporterError::UnexpectedResponse {
                command: command.to_string(),
                response: "missing body terminator".to_string(),
            });
        }
        self.buf.advance(2);
        Ok(body.to_vec())
    }

    async fn exchange(&mut self, command: &str) -> Result<Vec<u8>> {
        self.buf.clear();
        let frame = format!("{command}\r\n");
        self.conn
            .write_all(frame.as_bytes())
            .await
            .map_err(ExporterError::Connection)?;

        let line = self.read_line(command).await?;
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("OK"), Some(len)) => {
                let len = len.parse::<usize>().map_err(|_| ExporterError::UnexpectedResponse {
                    command: command.to_string(),
                    response: line.clone(),
                })?;
                self.read_body(command, len).await
            }
            (Some(word), None) if ERROR_REPLIES.contains(&word) => Err(ExporterError::Protocol {
                command: command.to_string(),
                reply: word.to_string(),
            }),
            _ => Err(ExporterError::UnexpectedResponse {
                command: command.to_string(),
                response: line.clone(),
            }),
        }
    }

    /// Send one command and return the reply body.
    ///
    /// Anything other than a clean error reply leaves the conversation in an
    /// unknown place, so the connection is dropped.
    async fn request(&mut self, command: &str) -> Result<Vec<u8>> {
        tracing::debug!(address = %self.conn.address(), command, "calling beanstalkd");
        let result = self.exchange(command).await;
        if let Err(e) = &result {
            if !matches!(e, ExporterError::Protocol { .. }) {
                self.reset().await;
            }
        }
        result
    }

    async fn reset(&mut self) {
        self.buf.clear();
        if let Err(e) = self.conn.close().await {
            tracing::debug!(error = %e, "error closing connection");
        }
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

fn parse_stats(command: &str, body: &[u8]) -> Result<StatMap> {
    match serde_yaml::from_slice::<Value>(body)? {
        Value::Mapping(mapping) => Ok(mapping
            .iter()
            .filter_map(|(key, value)| Some((scalar(key)?, scalar(value)?)))
            .collect()),
        Value::Null => Ok(StatMap::new()),
        _ => Err(ExporterError::UnexpectedResponse {
            command: command.to_string(),
            response: String::from_utf8_lossy(body).into_owned(),
        }),
    }
}

/// The tube list is read line by line rather than as typed YAML so that
/// names such as `1.10` or `null` come back exactly as the server sent them.
fn parse_list(command: &str, body: &[u8]) -> Result<Vec<String>> {
    let text = String::from_utf8_lossy(body);
    let mut tubes = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() || line == "---" {
            continue;
        }
        match line.strip_prefix("- ") {
            Some(name) => tubes.push(name.trim().to_string()),
            None => {
                return Err(ExporterError::UnexpectedResponse {
                    command: command.to_string(),
                    response: line.to_string(),
                })
            }
        }
    }
    Ok(tubes)
}

#[async_trait]
impl<D: Dialer + 'static> QueueClient for BeanstalkClient<D> {
    fn address(&self) -> &str {
        self.conn.address()
    }

    async fn connect(&mut self) -> io::Result<()> {
        self.conn.ensure_connected().await
    }

    async fn disconnect(&mut self) {
        self.reset().await;
    }

    async fn stats(&mut self) -> Result<StatMap> {
        let body = self.request("stats").await?;
        parse_stats("stats", &body)
    }

    async fn list_tubes(&mut self) -> Result<Vec<String>> {
        let body = self.request("list-tubes").await?;
        parse_list("list-tubes", &body)
    }

    async fn tube_stats(&mut self, tube: &str) -> Result<StatMap> {
        let command = format!("stats-tube {tube}");
        let body = self.request(&command).await?;
        parse_stats(&command, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lazy_conn::tests::PipeDialer;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn ok_frame(body: &str) -> Vec<u8> {
        format!("OK {}\r\n{}\r\n", body.len(), body).into_bytes()
    }

    /// Answer each received command from `replies`, in order.
    fn serve(server: tokio::io::DuplexStream, replies: Vec<(&'static str, Vec<u8>)>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            for (expected, reply) in replies {
                let line = lines.next_line().await.unwrap().unwrap();
                assert_eq!(line, expected);
                write.write_all(&reply).await.unwrap();
            }
        })
    }

    #[tokio::test]
    async fn test_stats() {
        let (dialer, mut accepted) = PipeDialer::new();
        let mut client = BeanstalkClient::new(LazyConn::new(dialer, None));
        client.connect().await.unwrap();

        let body = "---\ncurrent-jobs-ready: 3\nuptime: 120\nversion: \"1.12\"\nhostname: queue-1\nrusage-utime: 0.004000\n";
        let server = serve(accepted.recv().await.unwrap(), vec![("stats", ok_frame(body))]);

        let stats = client.stats().await.unwrap();
        assert_eq!(stats["current-jobs-ready"], "3");
        assert_eq!(stats["uptime"], "120");
        assert_eq!(stats["version"], "1.12");
        assert_eq!(stats["hostname"], "queue-1");
        assert_eq!(stats["rusage-utime"].parse::<f64>().unwrap(), 0.004);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_list_tubes_and_tube_stats() {
        let (dialer, mut accepted) = PipeDialer::new();
        let mut client = BeanstalkClient::new(LazyConn::new(dialer, None));
        client.connect().await.unwrap();

        let server = serve(
            accepted.recv().await.unwrap(),
            vec![
                ("list-tubes", ok_frame("---\n- default\n- mail-42\n- 2024\n")),
                ("stats-tube mail-42", ok_frame("---\nname: mail-42\ncurrent-jobs-ready: 7\n")),
            ],
        );

        assert_eq!(
            client.list_tubes().await.unwrap(),
            vec!["default", "mail-42", "2024"]
        );
        let stats = client.tube_stats("mail-42").await.unwrap();
        assert_eq!(stats["name"], "mail-42");
        assert_eq!(stats["current-jobs-ready"], "7");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_keeps_connection() {
        let (dialer, mut accepted) = PipeDialer::new();
        let dials = dialer.dials.clone();
        let mut client = BeanstalkClient::new(LazyConn::new(dialer, None));
        client.connect().await.unwrap();

        let server = serve(
            accepted.recv().await.unwrap(),
            vec![
                ("stats-tube gone", b"NOT_FOUND\r\n".to_vec()),
                ("stats-tube default", ok_frame("---\ntotal-jobs: 1\n")),
            ],
        );

        let err = client.tube_stats("gone").await.unwrap_err();
        assert!(matches!(err, ExporterError::Protocol { ref reply, .. } if reply == "NOT_FOUND"));
        assert_eq!(client.state(), ConnectionState::Connected);

        let stats = client.tube_stats("default").await.unwrap();
        assert_eq!(stats["total-jobs"], "1");
        assert_eq!(dials.load(std::sync::atomic::Ordering::SeqCst), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_reply_drops_connection() {
        let (dialer, mut accepted) = PipeDialer::new();
        let mut client = BeanstalkClient::new(LazyConn::new(dialer, None));
        client.connect().await.unwrap();

        let server = serve(accepted.recv().await.unwrap(), vec![("stats", b"WHAT\r\n".to_vec())]);

        let err = client.stats().await.unwrap_err();
        assert!(matches!(err, ExporterError::UnexpectedResponse { .. }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_split_across_reads() {
        let (dialer, mut accepted) = PipeDialer::new();
        let mut client = BeanstalkClient::new(LazyConn::new(dialer, None));
        client.connect().await.unwrap();

        let mut server = accepted.recv().await.unwrap();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 12];
            tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf).await.unwrap();
            assert_eq!(&buf, b"list-tubes\r\n");
            let frame = ok_frame("---\n- default\n");
            for piece in frame.chunks(3) {
                server.write_all(piece).await.unwrap();
                server.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            server
        });

        assert_eq!(client.list_tubes().await.unwrap(), vec!["default"]);
        drop(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_reconnects_after_hangup() {
        let (dialer, mut accepted) = PipeDialer::new();
        let mut client = BeanstalkClient::new(LazyConn::new(dialer, None));
        client.connect().await.unwrap();

        // Server reads the request then hangs up without answering.
        let mut first = accepted.recv().await.unwrap();
        let hangup = tokio::spawn(async move {
            let mut buf = [0u8; 7];
            tokio::io::AsyncReadExt::read_exact(&mut first, &mut buf).await.unwrap();
        });
        let err = client.stats().await.unwrap_err();
        assert!(err.is_connection());
        hangup.await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let next = tokio::spawn(async move {
            let server = accepted.recv().await.unwrap();
            serve(server, vec![("stats", ok_frame("---\npid: 1\n"))]).await.unwrap();
        });
        assert_eq!(client.stats().await.unwrap()["pid"], "1");
        next.await.unwrap();
    }

    #[test]
    fn test_parse_empty_bodies() {
        assert!(parse_stats("stats", b"---\n").unwrap().is_empty());
        assert!(parse_list("list-tubes", b"---\n").unwrap().is_empty());
        assert!(parse_stats("stats", b"- a\n").is_err());
        assert!(parse_list("list-tubes", b"---\nfoo: 1\n").is_err());
    }

    #[test]
    fn test_tube_names_kept_verbatim() {
        let tubes = parse_list(
            "list-tubes",
            b"---\n- default\n- 1.10\n- null\n- 1e3\n- 0x10\n- true\n",
        )
        .unwrap();
        assert_eq!(tubes, vec!["default", "1.10", "null", "1e3", "0x10", "true"]);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (dialer, mut accepted) = PipeDialer::new();
        let mut client = BeanstalkClient::new(LazyConn::new(dialer, None));
        client.connect().await.unwrap();

        let server = serve(
            accepted.recv().await.unwrap(),
            vec![("stats", b"OK 18446744073709551615\r\nxx\r\n".to_vec())],
        );

        let err = client.stats().await.unwrap_err();
        assert!(matches!(err, ExporterError::UnexpectedResponse { .. }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        server.await.unwrap();

        let (dialer, mut accepted) = PipeDialer::new();
        let mut client = BeanstalkClient::new(LazyConn::new(dialer, None));
        client.connect().await.unwrap();
        let too_big = format!("OK {}\r\n", MAX_BODY_LEN + 1).into_bytes();
        let server = serve(accepted.recv().await.unwrap(), vec![("list-tubes", too_big)]);

        let err = client.list_tubes().await.unwrap_err();
        assert!(matches!(err, ExporterError::UnexpectedResponse { .. }));
        server.await.unwrap();
    }
}
