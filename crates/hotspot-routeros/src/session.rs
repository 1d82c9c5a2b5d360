// Single RouterOS API session
//
// One command in flight at a time. A session that hit a connection-level
// error is left in an unknown framing state and must be discarded.

use std::time::{Duration, Instant};

use secrecy::ExposeSecret;
use tracing::{debug, trace};

use crate::command::Command;
use crate::error::Error;
use crate::models::Row;
use crate::protocol::{Reply, ReplyKind, read_sentence, write_sentence};
use crate::transport::{ApiStream, RouterCredentials, TransportConfig};

/// Result of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// One row per `!re` sentence.
    pub rows: Vec<Row>,
    /// `=ret=` value on `!done` (the new id after `add`).
    pub ret: Option<String>,
}

pub struct Session {
    stream: Box<dyn ApiStream>,
    io_timeout: Duration,
    last_used: Instant,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("io_timeout", &self.io_timeout)
            .field("idle", &self.last_used.elapsed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect and log in with the plaintext method (RouterOS 6.43+).
    pub async fn open(
        transport: &TransportConfig,
        credentials: &RouterCredentials,
    ) -> Result<Self, Error> {
        let stream = transport.connect().await?;
        let mut session = Self::from_stream(stream, transport.io_timeout);
        session.login(credentials).await?;
        debug!(endpoint = %transport.endpoint(), user = %credentials.username, "RouterOS session ready");
        Ok(session)
    }

    /// Wrap an already-connected stream (no login performed).
    pub fn from_stream(stream: Box<dyn ApiStream>, io_timeout: Duration) -> Self {
        Self {
            stream,
            io_timeout,
            last_used: Instant::now(),
        }
    }

    async fn login(&mut self, credentials: &RouterCredentials) -> Result<(), Error> {
        let cmd = Command::new("/login")
            .attr("name", credentials.username.clone())
            .attr("password", credentials.password.expose_secret());

        match self.execute(&cmd).await {
            Ok(output) if output.ret.is_some() => Err(Error::UnsupportedLogin),
            Ok(_) => Ok(()),
            Err(Error::Trap { message, .. }) => Err(Error::Authentication { message }),
            Err(e) => Err(e),
        }
    }

    /// Time since the session last completed a command.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Send a command and collect replies up to `!done`.
    pub async fn execute(&mut self, cmd: &Command) -> Result<CommandOutput, Error> {
        trace!(command = %cmd, "RouterOS send");
        write_sentence(&mut self.stream, &cmd.words()).await?;

        let mut output = CommandOutput::default();
        let mut trap: Option<Error> = None;

        loop {
            let words = tokio::time::timeout(self.io_timeout, read_sentence(&mut self.stream))
                .await
                .map_err(|_| Error::Timeout {
                    timeout_secs: self.io_timeout.as_secs(),
                })??;
            let reply = Reply::parse(words)?;

            match reply.kind {
                ReplyKind::Re => output.rows.push(Row::from(reply.attributes)),
                ReplyKind::Trap => {
                    // The router follows `!trap` with `!done`; keep reading so
                    // the session stays framed.
                    let message = reply
                        .attributes
                        .get("message")
                        .cloned()
                        .unwrap_or_else(|| "unknown failure".into());
                    let category = reply
                        .attributes
                        .get("category")
                        .and_then(|c| c.parse().ok());
                    trap.get_or_insert(Error::Trap {
                        command: cmd.path().to_owned(),
                        message,
                        category,
                    });
                }
                ReplyKind::Fatal => {
                    return Err(Error::Fatal {
                        message: reply.message.unwrap_or_default(),
                    });
                }
                ReplyKind::Done => {
                    output.ret = reply.attributes.get("ret").cloned();
                    break;
                }
            }
        }

        self.last_used = Instant::now();
        match trap {
            Some(err) => Err(err),
            None => {
                debug!(command = %cmd.path(), rows = output.rows.len(), "RouterOS command done");
                Ok(output)
            }
        }
    }

    /// Cheap liveness probe.
    pub async fn ping(&mut self) -> Result<(), Error> {
        self.execute(&Command::print("/system/identity")).await.map(|_| ())
    }
}
