use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::runtime::Runtime;
use handler::Pop3Handler;

pub mod handler;

/// Accept loop for the POP3 listener. One task per connection.
pub async fn serve(listener: TcpListener, runtime: Arc<Runtime>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move {
                    info!("New POP3 connection from {}", peer);
                    let handler = Pop3Handler::new(runtime, peer);
                    if let Err(e) = handler.run(stream).await {
                        error!("POP3 connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("POP3 accept error: {}", e);
            }
        }
    }
}
