use anyhow::Context;
use procwire::{PlatformRunnerFactory, Process, ProcessContext, RunnerConfig, StartRequest};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let command = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        anyhow::bail!("usage: procwire-demo <command>");
    }

    let context = ProcessContext::new(RunnerConfig::default());
    tracing::info!(platform = PlatformRunnerFactory::platform_name(), %command, "Starting command");

    let process = Process::start(&context, StartRequest::new(command))
        .await
        .context("failed to start command")?;
    process.stdin().close();

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let (copied_out, copied_err) = tokio::join!(
        process.stdout().pipe_to(&mut stdout),
        process.stderr().pipe_to(&mut stderr),
    );
    copied_out.context("failed to forward stdout")?;
    copied_err.context("failed to forward stderr")?;

    let code = process.join().await.context("command did not report an exit code")?;
    tracing::info!(pid = ?process.pid(), exit_code = code, "Command finished");

    drop(process);
    std::process::exit(code);
}
