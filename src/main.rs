use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use sshkit::cli::{ClientArgs, Cli, Commands, KeygenArgs, ServerArgs};
use sshkit::logging::{setup_logging, LogSettings};
use sshkit::ssh_client::ThreadedStdin;
use sshkit::{
    generate_keys, AuthorizedKeySet, ClientConfig, ClientSession, HostKeyPolicy, KeyManager,
    RemoteOutcome, ServerConfig, ServerIdentity, SshServer,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&LogSettings::from_flags(
        cli.log_level.into(),
        cli.quiet,
        cli.log_json,
    ));

    let result = match cli.command {
        Commands::Keygen(args) => keygen(args).map(|_| ExitCode::SUCCESS),
        Commands::Server(args) => server(args).await.map(|_| ExitCode::SUCCESS),
        Commands::Client(args) => client(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn keygen(args: KeygenArgs) -> Result<()> {
    let pair = generate_keys(args.bits, args.comment.as_deref())?;
    let manager = KeyManager::new(&args.private_key, &args.public_key);
    manager.write_keypair(&pair)?;

    println!("Private key: {}", args.private_key.display());
    println!("Public key:  {}", args.public_key.display());
    println!("Fingerprint: {}", pair.fingerprint);
    Ok(())
}

async fn server(args: ServerArgs) -> Result<()> {
    let identity = ServerIdentity::load(&args.key).context("loading host key")?;
    let authorized =
        AuthorizedKeySet::load(&args.authorized_keys).context("loading authorized keys")?;

    let config = ServerConfig {
        bind_address: args.bind,
        port: args.port,
        allowed_commands: args.allowed_commands,
    };
    let mut server = SshServer::new(config, identity, authorized)?;
    server.run().await?;
    Ok(())
}

async fn client(args: ClientArgs) -> Result<ExitCode> {
    let host_key_policy = if args.insecure_accept_any_host_key {
        HostKeyPolicy::AcceptAny
    } else if let Some(fingerprint) = &args.host_fingerprint {
        HostKeyPolicy::pinned(fingerprint)?
    } else if let Some(path) = &args.known_hosts {
        HostKeyPolicy::known_hosts(path)
    } else {
        HostKeyPolicy::default_known_hosts()?
    };

    let config = ClientConfig {
        host: args.host,
        port: args.port,
        user: args.user,
        key_path: args.key,
        timeout: args.timeout,
        host_key_policy,
    };
    let session = ClientSession::connect(config).await?;

    let outcome = match args.cmd.as_deref() {
        Some(cmd) if !cmd.is_empty() => {
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            session.run(cmd, &mut stdout, &mut stderr).await?
        }
        _ => {
            #[cfg(unix)]
            let _raw = sshkit::ssh_client::RawModeGuard::enable().context("switching terminal to raw mode")?;
            // 不能用 tokio::io::stdin：阻塞中的读取会拖住运行时退出
            let stdin = ThreadedStdin::spawn().context("starting stdin reader")?;
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            session.shell(stdin, &mut stdout, &mut stderr).await?
        }
    };

    let user = session.user().to_string();
    if let Err(e) = session.close().await {
        info!("disconnect: {}", e);
    }

    match &outcome {
        RemoteOutcome::Success => info!(%user, "session finished"),
        RemoteOutcome::ExitCode(code) => info!(%user, code, "remote command exited with non-zero status"),
        RemoteOutcome::SessionError(kind) => error!(%user, ?kind, "session ended without an exit status"),
    }
    Ok(exit_code(&outcome))
}

fn exit_code(outcome: &RemoteOutcome) -> ExitCode {
    u8::try_from(outcome.exit_code())
        .map(ExitCode::from)
        .unwrap_or(ExitCode::FAILURE)
}
