use clap::Parser;
use tracing_subscriber::EnvFilter;

use labvm::cli::{Cli, Command, StartArgs};
use labvm::error::VmError;
use labvm::{backend, commands, config};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout and are not failures; every
            // real usage error exits 1.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("labvm=info".parse().expect("valid log directive")),
        )
        .init();

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            let code = e.exit_code();
            let detail = e.stderr_excerpt().map(str::to_owned);
            eprintln!("{:?}", miette::Report::new(e));
            if let Some(detail) = detail {
                eprintln!("{detail}");
            }
            code
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32, VmError> {
    let args = match &cli.command {
        Command::Start(args) => args.clone(),
        _ => StartArgs::default(),
    };
    let config = config::resolve(&args)?;

    let dir = std::env::current_dir().map_err(|e| VmError::Io {
        context: "resolving current directory".into(),
        source: e,
    })?;
    let backend = backend::create_backend();

    match cli.command {
        Command::Start(_) => commands::start(&backend, &config, &dir).await?,
        Command::Stop => commands::stop(&backend, &config).await?,
        Command::Destroy => commands::destroy(&backend, &config, &dir).await?,
        Command::Status => commands::status(&backend, &config).await?,
        Command::Ssh => return commands::ssh(&backend, &config, &dir).await,
        Command::Console => return commands::console(&backend, &config).await,
        Command::Snapshot => commands::snapshot(&backend, &config, &dir).await?,
        Command::Restore => commands::restore(&backend, &config, &dir).await?,
    }
    Ok(0)
}
