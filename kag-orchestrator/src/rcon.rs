//! Line-based TCPR console relay.

use kag_common::{KagError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;

pub const TCPR_PORT: u16 = 50301;

/// Log in with `password`, then relay lines between `input`/`output` and the
/// server. Ends when the server closes the connection; EOF on `input`
/// half-closes our side so pending replies still arrive.
pub async fn run_session<R, W>(addr: &str, password: &str, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| KagError::RemoteConnect {
            ip: addr.to_string(),
            attempts: 1,
            reason: e.to_string(),
        })?;
    info!("[rcon] Connected to {}", addr);

    let (rd, mut wr) = stream.into_split();
    wr.write_all(format!("{}\n", password).as_bytes()).await?;

    let mut server_lines = BufReader::new(rd).lines();
    let mut input_lines = input.lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            line = input_lines.next_line(), if input_open => match line? {
                Some(line) => {
                    wr.write_all(line.as_bytes()).await?;
                    wr.write_all(b"\n").await?;
                }
                None => {
                    input_open = false;
                    wr.shutdown().await?;
                }
            },
            line = server_lines.next_line() => match line? {
                Some(line) => {
                    output.write_all(line.as_bytes()).await?;
                    output.write_all(b"\n").await?;
                    output.flush().await?;
                }
                None => break,
            },
        }
    }

    info!("[rcon] Connection to {} closed", addr);
    Ok(())
}
