// Rendezvous pipe
//
// Newline-delimited tokens exchanged with the controlled process outside
// the debug protocol: it announces READY, the controller answers GO, and
// QUIT asks it to finish. Anything else is a status line.

use crate::protocol::{CoordError, CoordResult};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Ready,
    Go,
    Quit,
    Status(String),
}

impl Token {
    pub fn parse(line: &str) -> Token {
        match line.trim() {
            "READY" => Token::Ready,
            "GO" => Token::Go,
            "QUIT" => Token::Quit,
            other => Token::Status(other.to_string()),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ready => write!(f, "READY"),
            Token::Go => write!(f, "GO"),
            Token::Quit => write!(f, "QUIT"),
            Token::Status(text) => write!(f, "{}", text),
        }
    }
}

pub struct Rendezvous<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Rendezvous<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub async fn send(&mut self, token: &Token) -> CoordResult<()> {
        debug!("Rendezvous send: {}", token);
        let line = format!("{}\n", token);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next token; blank lines are skipped
    pub async fn recv(&mut self, timeout: Duration) -> CoordResult<Token> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout_at(deadline, self.reader.read_line(&mut line))
                .await
                .map_err(|_| CoordError::Timeout(timeout))??;
            if read == 0 {
                info!("Rendezvous pipe closed");
                return Err(CoordError::Disconnected);
            }
            if line.trim().is_empty() {
                continue;
            }

            let token = Token::parse(&line);
            debug!("Rendezvous recv: {}", token);
            return Ok(token);
        }
    }

    /// Read until `expected` arrives, returning the status lines seen on the way
    pub async fn wait_for(&mut self, expected: &Token, timeout: Duration) -> CoordResult<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let mut statuses = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let token = self.recv(remaining).await.map_err(|e| match e {
                CoordError::Timeout(_) => CoordError::Timeout(timeout),
                other => other,
            })?;

            match token {
                token if &token == expected => return Ok(statuses),
                Token::Quit => {
                    info!("Controlled process quit while waiting for {}", expected);
                    return Err(CoordError::Disconnected);
                }
                Token::Status(text) => {
                    info!("Controlled process: {}", text);
                    statuses.push(text);
                }
                other => debug!("Ignoring {} while waiting for {}", other, expected),
            }
        }
    }
}
