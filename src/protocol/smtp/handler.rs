use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::framing::LineBuffer;
use crate::relay::{self, Envelope};
use crate::runtime::Runtime;

/// SMTP session states. Each variant carries exactly the transaction fields
/// that are valid in that state.
#[derive(Debug)]
enum State {
    Init,
    Greeted,
    AuthAwaitUser,
    AuthAwaitPass {
        username: String,
    },
    Ready {
        username: String,
    },
    GotSender {
        username: String,
        mail_from: String,
    },
    GotRecipient {
        username: String,
        mail_from: String,
        rcpt_to: String,
    },
    ReceivingData {
        username: String,
        mail_from: String,
        rcpt_to: String,
        body: String,
    },
}

enum Action {
    Continue,
    Close,
}

pub struct SmtpHandler {
    runtime: Arc<Runtime>,
    peer: SocketAddr,
    state: State,
}

impl SmtpHandler {
    pub fn new(runtime: Arc<Runtime>, peer: SocketAddr) -> Self {
        Self {
            runtime,
            peer,
            state: State::Init,
        }
    }

    pub async fn run(mut self, mut stream: TcpStream) -> Result<()> {
        let hostname = self.runtime.hostname().to_string();
        write_line(&mut stream, &format!("220 {} ESMTP RelayMail", hostname)).await?;

        let idle = self.runtime.idle_timeout();
        let mut lines = LineBuffer::new();
        let mut chunk = [0u8; 2048];

        loop {
            let n = match timeout(idle, stream.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => {
                    info!("SMTP connection from {} idle, closing", self.peer);
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
        let state = mem::replace(&mut self.state, State::Init);

        // In data mode every line is body text until the terminating dot.
        let state = match state {
            State::ReceivingData {
                username,
                mail_from,
                rcpt_to,
                mut body,
            } => {
                if line == "." {
                    let envelope = Envelope {
                        sender: mail_from,
                        recipient: rcpt_to,
                        body,
                    };
                    match relay::deliver(&self.runtime, envelope).await {
                        Ok(()) => write_line(stream, "250 2.6.0 Ok: queued").await?,
                        Err(e) => {
                            warn!("SMTP delivery failed: {}", e);
                            write_line(stream, "451 4.3.0 Temporary failure").await?;
                        }
                    }
                    self.state = State::Ready { username };
                } else {
                    // Dot unstuffing
                    let text = line.strip_prefix("..").map(|r| format!(".{}", r));
                    body.push_str(text.as_deref().unwrap_or(line));
                    body.push_str("\r\n");
                    self.state = State::ReceivingData {
                        username,
                        mail_from,
                        rcpt_to,
                        body,
                    };
                }
                return Ok(Action::Continue);
            }
            other => other,
        };

        let upper = line.to_ascii_uppercase();

        if upper == "QUIT" || upper.starts_with("QUIT ") {
            write_line(stream, "221 2.0.0 Bye").await?;
            return Ok(Action::Close);
        }

        match state {
            State::Init if upper.starts_with("EHLO") || upper.starts_with("HELO") => {
                let hostname = self.runtime.hostname().to_string();
                write_line(stream, &format!("250-{}", hostname)).await?;
                write_line(stream, "250-AUTH LOGIN PLAIN").await?;
                write_line(stream, "250 Ok").await?;
                self.state = State::Greeted;
            }
            State::Greeted if upper == "AUTH LOGIN" => {
                write_line(stream, &format!("334 {}", B64.encode("Username:"))).await?;
                self.state = State::AuthAwaitUser;
            }
            State::AuthAwaitUser => match decode_b64(line) {
                Some(username) => {
                    write_line(stream, &format!("334 {}", B64.encode("Password:"))).await?;
                    self.state = State::AuthAwaitPass { username };
                }
                None => return self.reject_auth(stream).await,
            },
            State::AuthAwaitPass { username } => {
                let presented = match decode_b64(line) {
                    Some(hash) => hash,
                    None => return self.reject_auth(stream).await,
                };
                match self.runtime.accounts().authenticate(&username, &presented) {
                    Ok(()) => {
                        info!("SMTP login for {} from {}", username, self.peer);
                        write_line(stream, "235 2.7.0 Authentication successful").await?;
                        self.state = State::Ready { username };
                    }
                    Err(_) => {
                        warn!("SMTP auth failed for {} from {}", username, self.peer);
                        return self.reject_auth(stream).await;
                    }
                }
            }
            State::Ready { username } if upper.starts_with("MAIL FROM:") => {
                match extract_address(&line["MAIL FROM:".len()..]) {
                    Some(mail_from) => {
                        write_line(stream, "250 2.1.0 Ok").await?;
                        self.state = State::GotSender { username, mail_from };
                    }
                    None => {
                        write_line(stream, "501 5.1.7 Bad sender address").await?;
                        self.state = State::Ready { username };
                    }
                }
            }
            State::GotSender { username, mail_from } if upper.starts_with("RCPT TO:") => {
                match extract_address(&line["RCPT TO:".len()..]) {
                    Some(rcpt_to) => {
                        write_line(stream, "250 2.1.5 Ok").await?;
                        self.state = State::GotRecipient {
                            username,
                            mail_from,
                            rcpt_to,
                        };
                    }
                    None => {
                        write_line(stream, "501 5.1.3 Bad recipient address").await?;
                        self.state = State::GotSender { username, mail_from };
                    }
                }
            }
            State::GotRecipient {
                username,
                mail_from,
                rcpt_to,
            } if upper == "DATA" => {
                write_line(stream, "354 End data with <CR><LF>.<CR><LF>").await?;
                self.state = State::ReceivingData {
                    username,
                    mail_from,
                    rcpt_to,
                    body: String::new(),
                };
            }
            _ => {
                // Command out of sequence: final status, then drop the session.
                warn!("SMTP protocol violation from {}: {:?}", self.peer, line);
                write_line(stream, "503 5.5.1 Bad sequence of commands").await?;
                return Ok(Action::Close);
            }
        }
        Ok(Action::Continue)
    }

    async fn reject_auth(&mut self, stream: &mut TcpStream) -> Result<Action> {
        write_line(stream, "535 5.7.8 Authentication credentials invalid").await?;
        Ok(Action::Close)
    }
}

async fn write_line(stream: &mut TcpStream, line: &str) -> Result<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    Ok(())
}

fn decode_b64(line: &str) -> Option<String> {
    let bytes = B64.decode(line.trim().as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Pull the bare address out of the argument of MAIL FROM: / RCPT TO:,
/// with or without angle brackets.
fn extract_address(arg: &str) -> Option<String> {
    let arg = arg.trim();
    let addr = if let (Some(start), Some(end)) = (arg.find('<'), arg.rfind('>')) {
        if start >= end {
            return None;
        }
        &arg[start + 1..end]
    } else {
        arg
    };
    let addr = addr.trim();
    if addr.is_empty() {
        None
    } else {
        Some(addr.to_string())
    }
}
