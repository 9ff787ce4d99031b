use std::sync::Arc;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use crate::runtime::Runtime;
use handler::SmtpHandler;

pub mod handler;

/// Accept loop for the inbound SMTP listener. One task per connection.
pub async fn serve(listener: TcpListener, runtime: Arc<Runtime>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move {
                    info!("New SMTP connection from {}", peer);
                    let handler = SmtpHandler::new(runtime, peer);
                    if let Err(e) = handler.run(stream).await {
                        error!("SMTP connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("SMTP accept error: {}", e);
            }
        }
    }
}

/// Outbound SMTP submission: relay one message to another domain's server,
/// authenticating as this server's relay identity.
pub async fn send_message(
    addr: &str,
    hostname: &str,
    relay_user: &str,
    relay_password_hash: &str,
    sender: &str,
    recipient: &str,
    body: &str,
) -> Result<()> {
    let tcp = TcpStream::connect(addr).await?;
    let (r, w) = tokio::io::split(tcp);
    let mut reader = BufReader::new(r);
    let mut writer = BufWriter::new(w);

    read_expect(&mut reader, 220).await?;
    ehlo(&mut writer, &mut reader, hostname).await?;

    // AUTH LOGIN with the distinguished relay identity
    write_line(&mut writer, "AUTH LOGIN".to_string()).await?;
    read_expect(&mut reader, 334).await?;
    write_line(&mut writer, B64.encode(relay_user)).await?;
    read_expect(&mut reader, 334).await?;
    write_line(&mut writer, B64.encode(relay_password_hash)).await?;
    read_expect(&mut reader, 235).await?;

    write_line(&mut writer, format!("MAIL FROM:<{}>", sender)).await?;
    read_expect(&mut reader, 250).await?;

    write_line(&mut writer, format!("RCPT TO:<{}>", recipient)).await?;
    read_expect(&mut reader, 250).await?;

    write_line(&mut writer, "DATA".to_string()).await?;
    read_expect(&mut reader, 354).await?;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with('.') {
            writer.write_all(b".").await?;
        }
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    write_line(&mut writer, ".".to_string()).await?;
    read_expect(&mut reader, 250).await?;

    write_line(&mut writer, "QUIT".to_string()).await?;
    let _ = read_line(&mut reader).await; // ignore final
    Ok(())
}

async fn ehlo<W, R>(writer: &mut BufWriter<W>, reader: &mut BufReader<R>, hostname: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    write_line(writer, format!("EHLO {}", hostname)).await?;
    // Read multiline 250 responses
    loop {
        let line = read_line(reader).await?;
        if !line.starts_with("250") {
            return Err(anyhow!("Unexpected EHLO response: {}", line));
        }
        if !line.starts_with("250-") {
            break;
        }
    }
    Ok(())
}

async fn write_line<W>(writer: &mut BufWriter<W>, line: String) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn read_line<R>(reader: &mut BufReader<R>) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = String::new();
    if reader.read_line(&mut buf).await? == 0 {
        return Err(anyhow!("connection closed by peer"));
    }
    Ok(buf.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_expect<R>(reader: &mut BufReader<R>, code: u16) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let line = read_line(reader).await?;
    if !line.starts_with(&code.to_string()) {
        return Err(anyhow!("SMTP expected {} got: {}", code, line));
    }
    Ok(line)
}
