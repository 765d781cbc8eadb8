//! Domainforge CLI
//!
//! Command-line interface for managing per-domain credentials.
//!
//! # Usage
//!
//! ```bash
//! # Authenticate a domain (opens the consent flow)
//! domainforge auth example.com --scopes https://www.googleapis.com/auth/admin.directory.user
//!
//! # Associate a service account and authenticate with it
//! domainforge set-service-account example.com robot@project.iam.gserviceaccount.com key.pem
//! domainforge auth-service-account example.com --subject admin@example.com
//!
//! # List domains and pick the default
//! domainforge domains
//! domainforge default example.com
//!
//! # Build a session for an API surface
//! domainforge --domain example.com session --surface directory
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use domainforge_core::{
    ApiSurface, DomainName, Forge, OAuthAuthenticator, ScopeSet, Settings,
};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "domainforge")]
#[command(about = "Multi-domain credential and session management")]
#[command(version)]
struct Cli {
    /// Domain to operate on instead of the default
    #[arg(short, long, global = true)]
    domain: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate a domain through the browser consent flow
    Auth {
        /// Domain name (e.g., example.com)
        domain: String,

        /// OAuth scopes to request (comma-separated)
        #[arg(short, long)]
        scopes: Option<String>,
    },

    /// Authenticate a domain with its service account
    AuthServiceAccount {
        /// Domain name
        domain: String,

        /// User to impersonate under domain-wide delegation
        #[arg(long)]
        subject: Option<String>,

        /// OAuth scopes to request (comma-separated)
        #[arg(short, long)]
        scopes: Option<String>,
    },

    /// Associate a service-account key with a domain
    SetServiceAccount {
        /// Domain name
        domain: String,

        /// Service account email
        email: String,

        /// Path to the PEM or JSON key file
        certificate: PathBuf,

        /// Password of an encrypted key
        #[arg(long)]
        key_password: Option<String>,
    },

    /// List known domains
    Domains,

    /// Show the default domain, or set it
    Default {
        /// Domain to make the default
        domain: Option<String>,
    },

    /// Build a session for an API surface and describe it
    Session {
        /// Domain name (defaults to --domain, then the default domain)
        domain: Option<String>,

        /// API surface (directory, groupssettings, reports, gmail)
        #[arg(long)]
        surface: String,

        /// User to impersonate
        #[arg(long = "as")]
        subject: Option<String>,

        /// Additional scopes (comma-separated)
        #[arg(short, long)]
        scopes: Option<String>,
    },

    /// Revoke a domain's credential
    SignOut {
        /// Domain name
        domain: String,
    },

    /// Forget a domain: credential, service account and default
    Remove {
        /// Domain name
        domain: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load().context("Failed to load settings")?;
    init_logging(&settings, cli.verbose);

    let interactive = matches!(cli.command, Commands::Auth { .. } | Commands::Session { .. });
    let authenticator = OAuthAuthenticator::from_settings(&settings).with_presenter(|url| {
        eprintln!("Open this URL in your browser to grant access:\n\n  {}\n", url);
    });
    let forge = Forge::builder(settings)
        .authenticator(Arc::new(authenticator))
        .interactive(interactive)
        .build()
        .context("Failed to initialize")?;

    match cli.command {
        Commands::Auth { domain, scopes } => {
            auth(&forge, &domain, scopes.as_deref()).await
        }
        Commands::AuthServiceAccount { domain, subject, scopes } => {
            auth_service_account(&forge, &domain, subject.as_deref(), scopes.as_deref()).await
        }
        Commands::SetServiceAccount { domain, email, certificate, key_password } => {
            set_service_account(&forge, &domain, &email, certificate, key_password)
        }
        Commands::Domains => list_domains(&forge).await,
        Commands::Default { domain } => default_domain(&forge, domain.as_deref()).await,
        Commands::Session { domain, surface, subject, scopes } => {
            let requested = domain.or(cli.domain);
            session(&forge, requested.as_deref(), &surface, subject.as_deref(), scopes.as_deref())
                .await
        }
        Commands::SignOut { domain } => sign_out(&forge, &domain).await,
        Commands::Remove { domain } => remove(&forge, &domain).await,
    }
}

fn init_logging(settings: &Settings, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_domain(name: &str) -> Result<DomainName> {
    DomainName::parse(name).with_context(|| format!("Invalid domain '{}'", name))
}

fn parse_scopes(scopes: Option<&str>) -> Result<ScopeSet> {
    let Some(scopes) = scopes else {
        return Ok(ScopeSet::new());
    };
    ScopeSet::parse(scopes.split(',').map(str::trim).filter(|s| !s.is_empty()))
        .context("Invalid scopes")
}

async fn auth(forge: &Forge, domain: &str, scopes: Option<&str>) -> Result<()> {
    let domain = parse_domain(domain)?;
    let scopes = parse_scopes(scopes)?;

    let credential = forge
        .authenticate_interactive(&domain, &scopes)
        .await
        .with_context(|| format!("Authentication failed for {}", domain))?;

    println!("Authenticated {}", domain);
    println!("  Scopes: {}", credential.scopes);
    println!("  Expires: {}", credential.expires_at.to_rfc3339());
    Ok(())
}

async fn auth_service_account(
    forge: &Forge,
    domain: &str,
    subject: Option<&str>,
    scopes: Option<&str>,
) -> Result<()> {
    let domain = parse_domain(domain)?;
    let scopes = parse_scopes(scopes)?;

    let credential = forge
        .authenticate_service_account(&domain, subject, &scopes)
        .await
        .with_context(|| format!("Service-account authentication failed for {}", domain))?;

    println!("Authenticated {} as {}", domain, credential.signer.as_deref().unwrap_or("?"));
    if let Some(subject) = &credential.subject {
        println!("  Acting as: {}", subject);
    }
    println!("  Expires: {}", credential.expires_at.to_rfc3339());
    Ok(())
}

fn set_service_account(
    forge: &Forge,
    domain: &str,
    email: &str,
    certificate: PathBuf,
    key_password: Option<String>,
) -> Result<()> {
    let domain = parse_domain(domain)?;
    let reference = forge
        .set_service_account(&domain, email, certificate, key_password)
        .with_context(|| format!("Failed to set service account for {}", domain))?;

    println!(
        "Service account {} ({}) associated with {}",
        reference.email,
        reference.certificate_path.display(),
        domain
    );
    Ok(())
}

async fn list_domains(forge: &Forge) -> Result<()> {
    let entries = forge.domain_entries().await.context("Failed to list domains")?;
    if entries.is_empty() {
        println!("No domains configured");
        return Ok(());
    }

    for entry in entries {
        let marker = if entry.is_default { "*" } else { " " };
        let mut notes = Vec::new();
        if entry.has_credential {
            notes.push("credential".to_string());
        }
        if let Some(sa) = &entry.service_account {
            notes.push(format!("service account {}", sa.email));
        }
        println!("{} {}  ({})", marker, entry.domain, notes.join(", "));
    }
    Ok(())
}

async fn default_domain(forge: &Forge, domain: Option<&str>) -> Result<()> {
    match domain {
        Some(name) => {
            let domain = parse_domain(name)?;
            forge
                .set_default_domain(&domain)
                .await
                .with_context(|| format!("Failed to set default domain to {}", domain))?;
            println!("Default domain set to {}", domain);
        }
        None => {
            let domain = forge.default_domain().context("No default domain")?;
            println!("{}", domain);
        }
    }
    Ok(())
}

async fn session(
    forge: &Forge,
    domain: Option<&str>,
    surface: &str,
    subject: Option<&str>,
    scopes: Option<&str>,
) -> Result<()> {
    let context = forge
        .resolve_domain(domain)
        .await
        .context("Failed to resolve domain")?;
    let scopes = parse_scopes(scopes)?;
    let surface = ApiSurface::new(surface);

    let session = forge
        .get_session(context.domain(), &surface, &scopes, subject)
        .await
        .with_context(|| format!("Failed to build {} session for {}", surface, context.domain()))?;

    let info = session.info();
    println!("{} ({})", info.name, info.version);
    println!("  Domain: {}", session.domain());
    if let Some(subject) = session.subject() {
        println!("  Acting as: {}", subject);
    }
    println!("  Base URL: {}", info.base_url);
    println!("  Scopes: {}", session.scopes());
    let remaining = session.expires_at() - chrono::Utc::now();
    println!(
        "  Expires: {} (in {} min)",
        session.expires_at().to_rfc3339(),
        remaining.num_minutes()
    );
    Ok(())
}

async fn sign_out(forge: &Forge, domain: &str) -> Result<()> {
    let domain = parse_domain(domain)?;
    forge
        .sign_out(&domain)
        .await
        .with_context(|| format!("Failed to sign out of {}", domain))?;
    println!("Signed out of {}", domain);
    Ok(())
}

async fn remove(forge: &Forge, domain: &str) -> Result<()> {
    let domain = parse_domain(domain)?;
    forge
        .remove_domain(&domain)
        .await
        .with_context(|| format!("Failed to remove {}", domain))?;
    println!("Removed {}", domain);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scopes() {
        assert!(parse_scopes(None).unwrap().is_empty());

        let scopes = parse_scopes(Some("scope.b, scope.a,,scope.b")).unwrap();
        assert_eq!(scopes.to_delimited(), "scope.a scope.b");

        assert!(parse_scopes(Some("bad scope")).is_err());
    }

    #[test]
    fn test_cli_parses_global_domain() {
        let cli = Cli::try_parse_from([
            "domainforge",
            "session",
            "--surface",
            "directory",
            "--as",
            "admin@example.com",
            "--domain",
            "example.com",
        ])
        .unwrap();

        assert_eq!(cli.domain.as_deref(), Some("example.com"));
        match cli.command {
            Commands::Session { domain, surface, subject, .. } => {
                assert!(domain.is_none());
                assert_eq!(surface, "directory");
                assert_eq!(subject.as_deref(), Some("admin@example.com"));
            }
            _ => panic!("expected session command"),
        }
    }
}
