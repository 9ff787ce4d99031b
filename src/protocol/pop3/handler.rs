use std::collections::BTreeSet;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::framing::LineBuffer;
use crate::runtime::Runtime;
use crate::storage::mailbox::MailMessage;

/// POP3 session states.
///
/// `Transaction` owns the snapshot taken at PASS time: LIST/RETR/DELE indices
/// are 1-based positions into it and stay stable even while new deliveries
/// append to the live mailbox. Deletions are staged and only applied at QUIT.
#[derive(Debug)]
enum State {
    AwaitUser,
    AwaitPass {
        username: String,
    },
    Transaction {
        username: String,
        snapshot: Vec<MailMessage>,
        staged: BTreeSet<usize>,
        last_accessed: usize,
    },
}

enum Action {
    Continue,
    Close,
}

pub struct Pop3Handler {
    runtime: Arc<Runtime>,
    peer: SocketAddr,
    state: State,
}

impl Pop3Handler {
    pub fn new(runtime: Arc<Runtime>, peer: SocketAddr) -> Self {
        Self {
            runtime,
            peer,
            state: State::AwaitUser,
        }
    }

    pub async fn run(mut self, mut stream: TcpStream) -> Result<()> {
        let hostname = self.runtime.hostname().to_string();
        write_line(&mut stream, &format!("+OK {} POP3 server ready", hostname)).await?;

        let idle = self.runtime.idle_timeout();
        let mut lines = LineBuffer::new();
        let mut chunk = [0u8; 2048];

        loop {
            let n = match timeout(idle, stream.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => {
                    info!("POP3 connection from {} idle, closing", self.peer);
                    return Ok(());
                }
            };
            if n == 0 {
                return Ok(());
            }
            lines.extend(&chunk[..n]);

            while let Some(line) = lines.next_line() {
                match self.handle_line(&mut stream, &line).await? {
                    Action::Continue => {}
                    Action::Close => return Ok(()),
                }
            }
        }
    }

    async fn handle_line(&mut self, stream: &mut TcpStream, line: &str) -> Result<Action> {
        let mut parts = line.trim().splitn(2, ' ');
        let cmd = parts.next().unwrap_or("").to_ascii_uppercase();
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

        if cmd == "QUIT" {
            return self.handle_quit(stream).await;
        }

        let state = mem::replace(&mut self.state, State::AwaitUser);
        match state {
            State::AwaitUser => match (cmd.as_str(), arg) {
                ("USER", Some(user)) => {
                    write_line(stream, &format!("+OK {} is a valid mailbox", user)).await?;
                    self.state = State::AwaitPass {
                        username: user.to_string(),
                    };
                }
                ("USER", None) => {
                    write_line(stream, "-ERR username required").await?;
                }
                _ => return self.reject_sequence(stream, &cmd).await,
            },
            State::AwaitPass { username } => match (cmd.as_str(), arg) {
                // RFC 1939 lets a client restart authorization with USER.
                ("USER", Some(user)) => {
                    write_line(stream, &format!("+OK {} is a valid mailbox", user)).await?;
                    self.state = State::AwaitPass {
                        username: user.to_string(),
                    };
                }
                ("USER", None) => {
                    write_line(stream, "-ERR username required").await?;
                    self.state = State::AwaitPass { username };
                }
                ("PASS", Some(hash)) => {
                    match self.runtime.accounts().authenticate(&username, hash) {
                        Ok(()) => {
                            let snapshot = self.runtime.store().snapshot(&username).await;
                            let count = snapshot.len();
                            let octets: usize = snapshot.iter().map(|m| m.size()).sum();
                            info!("POP3 login for {} from {}", username, self.peer);
                            write_line(
                                stream,
                                &format!(
                                    "+OK {}'s maildrop has {} messages ({} octets)",
                                    username, count, octets
                                ),
                            )
                            .await?;
                            self.state = State::Transaction {
                                username,
                                snapshot,
                                staged: BTreeSet::new(),
                                last_accessed: 0,
                            };
                        }
                        Err(_) => {
                            warn!("POP3 auth failed for {} from {}", username, self.peer);
                            write_line(stream, "-ERR authentication failed").await?;
                            self.state = State::AwaitUser;
                        }
                    }
                }
                ("PASS", None) => {
                    write_line(stream, "-ERR password required").await?;
                    self.state = State::AwaitPass { username };
                }
                _ => return self.reject_sequence(stream, &cmd).await,
            },
            State::Transaction {
                username,
                snapshot,
                mut staged,
                mut last_accessed,
            } => {
                match cmd.as_str() {
                    "STAT" => {
                        let (count, octets) = maildrop_stats(&snapshot, &staged);
                        write_line(stream, &format!("+OK {} {}", count, octets)).await?;
                    }
                    "LIST" => match arg {
                        Some(arg) => match parse_index(arg, snapshot.len()) {
                            Ok(idx) if !staged.contains(&(idx - 1)) => {
                                write_line(
                                    stream,
                                    &format!("+OK {} {}", idx, snapshot[idx - 1].size()),
                                )
                                .await?;
                            }
                            Ok(_) => write_line(stream, "-ERR no such message").await?,
                            Err(reply) => write_line(stream, reply).await?,
                        },
                        None => {
                            let (count, octets) = maildrop_stats(&snapshot, &staged);
                            write_line(
                                stream,
                                &format!("+OK {} messages ({} octets)", count, octets),
                            )
                            .await?;
                            for (i, msg) in snapshot.iter().enumerate() {
                                if !staged.contains(&i) {
                                    write_line(stream, &format!("{} {}", i + 1, msg.size()))
                                        .await?;
                                }
                            }
                            write_line(stream, ".").await?;
                        }
                    },
                    "RETR" => match arg.map(|a| parse_index(a, snapshot.len())) {
                        Some(Ok(idx)) if !staged.contains(&(idx - 1)) => {
                            let msg = &snapshot[idx - 1];
                            write_line(stream, &format!("+OK {} octets", msg.size())).await?;
                            write_line(stream, &format!("From: {}", msg.from)).await?;
                            write_line(
                                stream,
                                &format!("To: {}@{}", username, self.runtime.domain()),
                            )
                            .await?;
                            write_line(stream, "").await?;
                            for body_line in msg.msg.lines() {
                                let body_line = body_line.trim_end_matches('\r');
                                // Byte-stuffing for lines starting with .
                                if body_line.starts_with('.') {
                                    stream.write_all(b".").await?;
                                }
                                write_line(stream, body_line).await?;
                            }
                            write_line(stream, ".").await?;
                            last_accessed = last_accessed.max(idx);
                        }
                        Some(Ok(_)) => write_line(stream, "-ERR no such message").await?,
                        Some(Err(reply)) => write_line(stream, reply).await?,
                        None => write_line(stream, "-ERR argument required").await?,
                    },
                    "DELE" => match arg.map(|a| parse_index(a, snapshot.len())) {
                        Some(Ok(idx)) => {
                            // Idempotent: re-staging the same index is a no-op.
                            staged.insert(idx - 1);
                            last_accessed = last_accessed.max(idx);
                            write_line(stream, &format!("+OK message {} deleted", idx)).await?;
                        }
                        Some(Err(reply)) => write_line(stream, reply).await?,
                        None => write_line(stream, "-ERR argument required").await?,
                    },
                    "NOOP" => write_line(stream, "+OK").await?,
                    "LAST" => write_line(stream, &format!("+OK {}", last_accessed)).await?,
                    "RSET" => {
                        staged.clear();
                        let octets: usize = snapshot.iter().map(|m| m.size()).sum();
                        write_line(
                            stream,
                            &format!("+OK maildrop has {} messages ({} octets)", snapshot.len(), octets),
                        )
                        .await?;
                    }
                    _ => {
                        write_line(stream, "-ERR unknown command").await?;
                    }
                }
                self.state = State::Transaction {
                    username,
                    snapshot,
                    staged,
                    last_accessed,
                };
            }
        }
        Ok(Action::Continue)
    }

    async fn handle_quit(&mut self, stream: &mut TcpStream) -> Result<Action> {
        let state = mem::replace(&mut self.state, State::AwaitUser);
        if let State::Transaction {
            username,
            snapshot,
            staged,
            ..
        } = state
        {
            if !staged.is_empty() {
                // The client still gets a final status line even when the
                // staged deletions cannot be applied.
                if let Err(e) = self
                    .runtime
                    .store()
                    .compact(&username, &staged, snapshot.len())
                    .await
                {
                    warn!("POP3 compaction failed for {}: {}", username, e);
                    write_line(stream, "-ERR maildrop update failed").await?;
                    return Ok(Action::Close);
                }
            }
        }
        let hostname = self.runtime.hostname().to_string();
        write_line(stream, &format!("+OK {} POP3 server signing off", hostname)).await?;
        Ok(Action::Close)
    }

    async fn reject_sequence(&mut self, stream: &mut TcpStream, cmd: &str) -> Result<Action> {
        warn!("POP3 protocol violation from {}: {:?}", self.peer, cmd);
        write_line(stream, "-ERR bad sequence of commands").await?;
        Ok(Action::Close)
    }
}

fn maildrop_stats(snapshot: &[MailMessage], staged: &BTreeSet<usize>) -> (usize, usize) {
    let mut count = 0;
    let mut octets = 0;
    for (i, msg) in snapshot.iter().enumerate() {
        if !staged.contains(&i) {
            count += 1;
            octets += msg.size();
        }
    }
    (count, octets)
}

/// Validate a 1-based message index argument against the snapshot size.
/// Returns the ready-to-send error reply on failure.
fn parse_index(arg: &str, len: usize) -> Result<usize, &'static str> {
    match arg.parse::<usize>() {
        Ok(idx) if idx >= 1 && idx <= len => Ok(idx),
        Ok(_) => Err("-ERR no such message"),
        Err(_) => Err("-ERR invalid argument"),
    }
}

async fn write_line(stream: &mut TcpStream, line: &str) -> Result<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(size: usize) -> MailMessage {
        MailMessage {
            from: "a@x".into(),
            msg: "m".repeat(size),
        }
    }

    #[test]
    fn parse_index_validates_range_and_syntax() {
        assert_eq!(parse_index("1", 3), Ok(1));
        assert_eq!(parse_index("3", 3), Ok(3));
        assert_eq!(parse_index("0", 3), Err("-ERR no such message"));
        assert_eq!(parse_index("4", 3), Err("-ERR no such message"));
        assert_eq!(parse_index("two", 3), Err("-ERR invalid argument"));
        assert_eq!(parse_index("-1", 3), Err("-ERR invalid argument"));
    }

    #[test]
    fn stats_skip_staged_messages() {
        let snapshot = vec![msg(10), msg(20), msg(30)];
        let staged: BTreeSet<usize> = [1].into_iter().collect();
        assert_eq!(maildrop_stats(&snapshot, &staged), (2, 40));
        assert_eq!(maildrop_stats(&snapshot, &BTreeSet::new()), (3, 60));
    }
}
