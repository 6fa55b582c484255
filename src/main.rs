use appdown::{
    AppdownError, AuthOutcome, Challenge, Config, DownloadRequest, Downloader,
    FileCredentialStore, PackagingOutcome, Result, TransferState,
};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

const PB_STYLE: &str =
    "{spinner:.blue} [{elapsed_precise}] {wide_bar:.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

#[derive(Parser, Debug)]
#[command(name = "appdown")]
#[command(about = "Download current and historical iOS app builds from your account")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Where the account record and metadata fallbacks live
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in and remember the account
    Login {
        /// Account email
        #[arg(short, long, required = true)]
        email: String,

        /// Password (prompted when omitted)
        #[arg(short, long)]
        password: Option<String>,

        /// Verification code (prompted when the store asks for one)
        #[arg(short, long)]
        code: Option<String>,
    },

    /// Forget the stored account
    Logout,

    /// Show the stored account
    Account,

    /// List the builds available for an app
    Versions {
        /// Numeric store id of the app
        app_id: String,
    },

    /// Download, verify and annotate an app
    Download {
        /// Numeric store id of the app
        app_id: String,

        /// Historical build id (current build when omitted)
        #[arg(short, long)]
        build: Option<String>,

        /// Output file or directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Get a free license first if the account has none
        #[arg(long)]
        purchase: bool,

        /// Leave the IPA untouched
        #[arg(long)]
        no_metadata: bool,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("[!] {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::new(Config::data_dir()),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let store = Arc::new(FileCredentialStore::new(config.credentials_path()));
        let downloader = Downloader::new(config, store)?;

        match cli.command {
            Commands::Login {
                email,
                password,
                code,
            } => run_login(&downloader, email, password, code).await,
            Commands::Logout => {
                if downloader.logout()? {
                    println!("[*] signed out");
                } else {
                    println!("[?] no account was stored");
                }
                Ok(())
            }
            Commands::Account => run_account(&downloader),
            Commands::Versions { app_id } => run_versions(&downloader, &app_id).await,
            Commands::Download {
                app_id,
                build,
                output,
                purchase,
                no_metadata,
            } => {
                let request = DownloadRequest {
                    app_id,
                    build_id: build,
                    output,
                    purchase,
                    skip_metadata: no_metadata,
                };
                run_download(&downloader, request).await
            }
        }
    })
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn prompt(label: &str) -> Result<String> {
    print!("[<] {}: ", label);
    std::io::stdout().flush()?;
    let mut response = String::new();
    std::io::stdin().read_line(&mut response)?;
    let response = response.trim().to_string();
    if response.is_empty() {
        return Err(AppdownError::InvalidInput(format!("{} is required", label)));
    }
    Ok(response)
}

async fn run_login(
    downloader: &Downloader,
    email: String,
    password: Option<String>,
    mut code: Option<String>,
) -> Result<()> {
    let password = match password {
        Some(p) => p,
        None => prompt("password")?,
    };

    loop {
        match downloader.login(&email, &password, code.as_deref()).await? {
            AuthOutcome::Authenticated(session) => {
                let identity = session.identity();
                if identity.has_token() {
                    println!("[*] signed in as {} ({})", identity.display_name(), identity.email);
                } else {
                    println!("[?] the store accepted the login but sent no token, try again later");
                }
                return Ok(());
            }
            AuthOutcome::ChallengeRequired(Challenge::VerificationCode) if code.is_none() => {
                println!("[?] {}", Challenge::VerificationCode);
                code = Some(prompt("verification code")?);
            }
            AuthOutcome::ChallengeRequired(challenge) => {
                return Err(AppdownError::ChallengeRequired(challenge));
            }
        }
    }
}

fn run_account(downloader: &Downloader) -> Result<()> {
    match downloader.restore_session()? {
        Some(session) => {
            let identity = session.identity();
            println!("[*] name: {}", identity.display_name());
            println!("[*] email: {}", identity.email);
            println!("[*] account id: {}", identity.dsid);
            println!("[*] storefront: {}", identity.storefront);
            println!("[*] country: {}", identity.country_code);
        }
        None => println!("[?] not signed in"),
    }
    Ok(())
}

async fn run_versions(downloader: &Downloader, app_id: &str) -> Result<()> {
    downloader.restore_session()?;
    let builds = downloader.resolve_versions(app_id).await?;
    println!("[*] {} builds", builds.len());
    for build in builds {
        let released = build
            .released
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!(
            "{:>12}  {:<24} {:<10}{}",
            build.build_id,
            build.label,
            released,
            if build.is_current { " (current)" } else { "" }
        );
    }
    Ok(())
}

async fn run_download(downloader: &Downloader, request: DownloadRequest) -> Result<()> {
    if downloader.restore_session()?.is_none() {
        return Err(AppdownError::InvalidInput(
            "not signed in, run `appdown login` first".to_string(),
        ));
    }

    println!("[*] downloading {}...", request.app_id);
    let (tx, rx) = mpsc::unbounded_channel();
    let bar = tokio::spawn(render_progress(rx));
    let result = downloader.download(&request, Some(tx)).await;
    let _ = bar.await;
    let report = result?;

    println!("[*] verified {} ({:?})", report.integrity.computed, report.integrity.algorithm);
    match &report.packaging {
        Some(PackagingOutcome::Degraded {
            metadata_path,
            reason,
            ..
        }) => {
            println!("[?] {}", AppdownError::PackagingDegraded(reason.clone()));
            if let Some(metadata_path) = metadata_path {
                println!("[?] metadata written to {}", metadata_path.display());
            }
        }
        Some(PackagingOutcome::Embedded { .. }) => println!("[*] metadata embedded"),
        None => {}
    }
    println!(
        "[*] done: {} {} -> {}",
        report.display_name,
        report.version.as_deref().unwrap_or("?"),
        report.path.display()
    );
    Ok(())
}

/// Drive a progress bar until the transfer drops its sender.
async fn render_progress(mut rx: mpsc::UnboundedReceiver<TransferState>) {
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template(PB_STYLE) {
        pb.set_style(style);
    }
    while let Some(state) = rx.recv().await {
        if let Some(total) = state.total {
            pb.set_length(total);
        }
        pb.set_position(state.transferred);
    }
    pb.finish_and_clear();
}
