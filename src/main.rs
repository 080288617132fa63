use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use halos_oidc_tester::{flow, report, RunConfig, Scenario};

#[derive(Parser)]
#[command(name = "halos-oidc-tester")]
#[command(author = "HALOS Team")]
#[command(version = "0.1.0")]
#[command(about = "OIDC/SSO authentication flow verifier", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the fresh-login authorization code flow
    Fresh {
        #[command(flatten)]
        opts: FlowOpts,
    },

    /// Verify single-sign-on session reuse across subdomains
    Sso {
        #[command(flatten)]
        opts: FlowOpts,
    },

    /// Run both scenarios as isolated runs with one combined report
    All {
        #[command(flatten)]
        opts: FlowOpts,
    },
}

#[derive(Args, Clone)]
struct FlowOpts {
    /// Identity provider username
    #[arg(short, long, env = "AUTHELIA_USERNAME", default_value = "admin")]
    username: String,

    /// Identity provider password
    #[arg(short, long, env = "AUTHELIA_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Base domain; the IdP is expected at auth.<domain>, the app at signalk.<domain>
    #[arg(short, long, env = "HALOS_DOMAIN")]
    domain: Option<String>,

    /// OIDC client id registered for the app
    #[arg(long, default_value = "signalk")]
    client_id: String,

    /// Permission level the app must grant after login
    #[arg(long, default_value = "admin")]
    expect_level: String,

    /// Output directory for reports and captured HTTP traces
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Accept self-signed TLS certificates (the target fleet uses them)
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    insecure: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "15")]
    timeout: u64,

    /// Redirect hop bound when following chains
    #[arg(long, default_value = "10")]
    max_redirects: usize,

    /// Wall-clock budget per flow run in seconds
    #[arg(long, default_value = "120")]
    budget: u64,

    /// Enable per-step debug echo
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (scenario, opts) = match cli.command {
        Commands::Fresh { opts } => (Scenario::Fresh, opts),
        Commands::Sso { opts } => (Scenario::Sso, opts),
        Commands::All { opts } => (Scenario::All, opts),
    };

    let mut logger = env_logger::Builder::from_default_env();
    if opts.verbose {
        logger.filter_module("halos_oidc_tester", log::LevelFilter::Debug);
    }
    logger.init();

    let config = match RunConfig::resolve(
        opts.username,
        opts.password,
        opts.domain,
        opts.client_id,
        opts.expect_level,
        opts.output,
        opts.insecure,
        opts.timeout,
        opts.max_redirects,
        opts.budget,
        opts.verbose,
    ) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            std::process::exit(report::EXIT_FAILURE);
        }
    };

    println!(
        "{} Verifying OIDC flow for domain: {}",
        "▶".green().bold(),
        config.domain.cyan()
    );
    println!("  IdP: {}", config.idp_url().cyan());
    println!("  App: {}", config.app_url().cyan());
    println!(
        "  Output: {}",
        config.output_dir.display().to_string().cyan()
    );
    if config.insecure {
        println!("  TLS: {}", "accepting self-signed certificates".yellow());
    }

    let run = match flow::run_scenarios(&config, scenario).await {
        Ok(run) => run,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            std::process::exit(report::EXIT_FAILURE);
        }
    };

    match report::finalize(&run, &config.output_dir) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            std::process::exit(report::EXIT_FAILURE);
        }
    }
}
