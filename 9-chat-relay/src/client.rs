use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, line::write_line};

const USERNAME_PROMPT: &str = "Enter your username for the group chat:";

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let username = match args.username {
        Some(username) => username,
        None => prompt_username(&mut stdin, &mut stdout).await?,
    };

    let (mut server, mut writer) = establish_connection(args.server).await?;
    write_line(&mut writer, &username)
        .await
        .context("failed to send username")?;

    run_client_loop(&mut server, &mut writer, &mut stdin, &mut stdout, &username).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn prompt_username<R, O>(stdin: &mut Lines<R>, out: &mut O) -> Result<String>
where
    R: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    write_output(out, USERNAME_PROMPT).await?;
    stdin
        .next_line()
        .await
        .context("failed to read username")?
        .context("stdin closed before a username was entered")
}

async fn establish_connection(
    server: SocketAddr,
) -> Result<(Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;

    info!("connected to {server}");

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader).lines(), writer))
}

/// Pumps server lines to `out` and stdin lines to the server until either
/// side closes.
///
/// Both reads go through `Lines::next_line`, which keeps partial input
/// buffered when the other branch wins, so no line is ever cut in half.
async fn run_client_loop<S, W, I, O>(
    server: &mut Lines<S>,
    writer: &mut W,
    stdin: &mut Lines<I>,
    out: &mut O,
    username: &str,
) -> Result<()>
where
    S: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        select! {
            server_line = server.next_line() => {
                if !handle_server_line(server_line, out).await? {
                    break;
                }
            }
            input = stdin.next_line() => {
                if !handle_stdin_input(input, writer, username).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line<O>(line: io::Result<Option<String>>, out: &mut O) -> Result<bool>
where
    O: AsyncWrite + Unpin,
{
    match line? {
        Some(line) => {
            write_output(out, &line).await?;
            Ok(true)
        }
        None => {
            info!("server closed the connection");
            Ok(false)
        }
    }
}

async fn handle_stdin_input<W>(
    input: io::Result<Option<String>>,
    writer: &mut W,
    username: &str,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(text) = input? else {
        return Ok(false);
    };

    write_line(writer, &format_chat_line(username, &text)).await?;
    Ok(true)
}

/// The server relays lines untouched, so the sender prefixes its own name.
pub fn format_chat_line(username: &str, text: &str) -> String {
    format!("{username}: {text}")
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_output<O>(out: &mut O, line: &str) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
