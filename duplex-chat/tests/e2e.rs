use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const PROMPT: &str = "*** type a message and press enter, 'quit' to leave";

#[tokio::test]
async fn server_and_client_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("duplex_chat");

    let mut server = spawn(&binary, &["server", "--host", "127.0.0.1", "--port", "0"])?;
    let banner = read_line_expect(&mut server.stdout, "waiting for server banner").await?;
    let addr = banner
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?
        .to_string();
    let port = addr
        .rsplit(':')
        .next()
        .context("server banner missing port")?
        .to_string();

    let mut client = spawn(&binary, &["client", "--host", "127.0.0.1", "--port", port.as_str()])?;
    let connected = read_line_expect(&mut client.stdout, "waiting for client banner").await?;
    assert_eq!(connected, format!("*** connected to 127.0.0.1:{port}"));
    let client_prompt = read_line_expect(&mut client.stdout, "waiting for client prompt").await?;
    assert_eq!(client_prompt, PROMPT);

    let accepted = read_line_expect(&mut server.stdout, "waiting for accept notice").await?;
    assert!(accepted.starts_with("*** peer connected from 127.0.0.1:"), "{accepted}");
    let server_prompt = read_line_expect(&mut server.stdout, "waiting for server prompt").await?;
    assert_eq!(server_prompt, PROMPT);

    client.send_line("hello").await.context("client send line")?;
    let server_hears = read_line_expect(&mut server.stdout, "waiting for server to hear").await?;
    assert_eq!(server_hears, "peer: hello");

    server.send_line("hi").await.context("server send line")?;
    let client_hears = read_line_expect(&mut client.stdout, "waiting for client to hear").await?;
    assert_eq!(client_hears, "peer: hi");

    client.send_line("quit").await.context("client send quit")?;
    let client_quit = read_line_expect(&mut client.stdout, "waiting for client quit").await?;
    assert_eq!(client_quit, "*** leaving chat");
    let server_sees_quit =
        read_line_expect(&mut server.stdout, "waiting for server disconnect notice").await?;
    assert_eq!(server_sees_quit, "*** peer disconnected");

    let client_done = read_line_expect(&mut client.stdout, "waiting for client exit line").await?;
    assert_eq!(client_done, "*** client terminated");
    let server_done = read_line_expect(&mut server.stdout, "waiting for server exit line").await?;
    assert_eq!(server_done, "*** server terminated");

    ensure_success(&mut client.child, "client").await?;
    ensure_success(&mut server.child, "server").await?;
    Ok(())
}

#[tokio::test]
async fn client_exits_non_zero_when_nobody_listens() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("duplex_chat");
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };

    let port = port.to_string();
    let mut client = spawn(&binary, &["client", "--port", port.as_str()])?;
    let status = timeout(READ_TIMEOUT, client.child.wait()).await??;
    assert!(!status.success());
    Ok(())
}

#[tokio::test]
async fn server_exits_non_zero_when_port_is_taken() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("duplex_chat");
    let holder = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = holder.local_addr()?.port().to_string();

    let mut server = spawn(&binary, &["server", "--host", "127.0.0.1", "--port", port.as_str()])?;
    let status = timeout(READ_TIMEOUT, server.child.wait()).await??;
    assert!(!status.success());

    drop(holder);
    Ok(())
}

#[tokio::test]
async fn client_leaves_cleanly_when_stdin_closes() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("duplex_chat");
    // The kernel completes the handshake from the backlog; nobody needs to accept.
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port().to_string();

    let mut client = spawn(&binary, &["client", "--host", "127.0.0.1", "--port", port.as_str()])?;
    let connected = read_line_expect(&mut client.stdout, "waiting for client banner").await?;
    assert_eq!(connected, format!("*** connected to 127.0.0.1:{port}"));
    let prompt = read_line_expect(&mut client.stdout, "waiting for client prompt").await?;
    assert_eq!(prompt, PROMPT);

    drop(client.stdin);
    let closed = read_line_expect(&mut client.stdout, "waiting for input closed notice").await?;
    assert_eq!(closed, "*** input closed, leaving chat");
    let done = read_line_expect(&mut client.stdout, "waiting for client exit line").await?;
    assert_eq!(done, "*** client terminated");

    ensure_success(&mut client.child, "client").await?;
    drop(listener);
    Ok(())
}

struct EndpointProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl EndpointProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

fn spawn(binary: &Path, args: &[&str]) -> Result<EndpointProcess> {
    let mut child = Command::new(binary)
        .args(args)
        .env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {args:?}"))?;

    let stdin = child.stdin.take().context("stdin missing after spawn")?;
    let stdout = child.stdout.take().context("stdout missing after spawn")?;

    Ok(EndpointProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    let mut line = String::new();
    let bytes = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result.with_context(|| format!("{description}: failed to read line"))?,
        Err(_) => return Err(anyhow!("{description}: timed out")),
    };
    if bytes == 0 {
        return Err(anyhow!("{description}: stream closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .with_context(|| format!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
