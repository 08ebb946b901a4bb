use anyhow::Result;
use clap::Parser;
use tokio::{
    io::{BufReader, Stdout},
    net::TcpStream,
};
use tracing::error;

use duplex_chat::{
    cli::{ClientArgs, Cli, Command, ServerArgs},
    connection::Connection,
    establish::{self, EstablishError, Listener},
    session::{Session, write_notice},
};

const PROMPT_NOTICE: &str = "*** type a message and press enter, 'quit' to leave";

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(cli));
    // A pending stdin read holds a blocking-pool thread until the next line
    // arrives, so the runtime must not wait for it.
    runtime.shutdown_background();
    result
}

async fn run(cli: Cli) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let (role, stream, peer_label) = match cli.command {
        Command::Server(args) => ("server", serve(&args, &mut stdout).await?, args.peer_label),
        Command::Client(args) => ("client", dial(&args, &mut stdout).await?, args.peer_label),
    };

    write_notice(&mut stdout, PROMPT_NOTICE).await?;

    let console = BufReader::new(tokio::io::stdin());
    let session = Session::new(console, Connection::new(stream), stdout, peer_label);
    let mut summary = session.run_until_ctrl_c().await;
    write_notice(&mut summary.output, &format!("*** {role} terminated")).await?;

    Ok(())
}

async fn serve(args: &ServerArgs, stdout: &mut Stdout) -> Result<TcpStream> {
    let listener = Listener::bind(&args.host, args.port).map_err(report)?;
    let addr = listener.local_addr()?;
    write_notice(stdout, &format!("*** waiting for a peer on {addr}")).await?;

    let (stream, peer) = listener.accept_one().await.map_err(report)?;
    write_notice(stdout, &format!("*** peer connected from {peer}")).await?;
    Ok(stream)
}

async fn dial(args: &ClientArgs, stdout: &mut Stdout) -> Result<TcpStream> {
    let stream = establish::connect(&args.host, args.port)
        .await
        .map_err(report)?;
    write_notice(stdout, &format!("*** connected to {}:{}", args.host, args.port)).await?;
    Ok(stream)
}

fn report(err: EstablishError) -> anyhow::Error {
    error!(error = %err, hint = %err.hint(), "could not establish connection");
    err.into()
}
