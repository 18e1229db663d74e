//! sealvault - Double-encrypted file vault
//!
//! Usage:
//!   sealvault init                      - Create config, directories and server keys
//!   sealvault status                    - Show key and storage status
//!   sealvault upload <path> --key --iv  - Store a client-encrypted file
//!   sealvault download <id>             - Recover client ciphertext, key and IV
//!   sealvault share <id>                - Issue a shareable link

use clap::{Parser, Subcommand};
use sealvault::{
    access::GrantRequest,
    config::Config,
    crypto::KeyStore,
    storage::{FileId, Role, User},
    vault::{DownloadIntent, FileVault},
    Error, Result,
};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sealvault")]
#[command(author = "sealvault Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Double-encrypted file vault with time-boxed sharing")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/sealvault/config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Acting username (defaults to $USER)
    #[arg(short, long)]
    user: Option<String>,

    /// Role of the acting user (admin, regular, guest)
    #[arg(long, default_value = "regular")]
    role: Role,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create configuration, directories and server key material
    Init {
        /// Data directory (defaults to the platform data dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Show key and storage status
    Status,

    /// Store a file that is already encrypted by the client
    Upload {
        /// Client ciphertext file
        path: PathBuf,

        /// Client symmetric key, hex encoded
        #[arg(long)]
        key: String,

        /// Client IV, hex encoded
        #[arg(long)]
        iv: String,

        /// Display name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Recover the client ciphertext, key and IV of a file
    Download {
        /// File ID
        file_id: Option<FileId>,

        /// Download through a shareable link token instead
        #[arg(long, conflicts_with = "file_id")]
        link: Option<String>,

        /// Request inline rendering rather than saving
        #[arg(long)]
        render: bool,

        /// Write the response here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List owned and shared files
    List,

    /// Show file details
    Show {
        /// File ID
        file_id: FileId,
    },

    /// Delete a file
    Delete {
        /// File ID
        file_id: FileId,
    },

    /// Grant a user access to a file
    Grant {
        /// File ID
        file_id: FileId,

        /// Username to grant
        username: String,

        /// Also allow download
        #[arg(long)]
        download: bool,
    },

    /// Revoke a user's access to a file
    Revoke {
        /// File ID
        file_id: FileId,

        /// Username to revoke
        username: String,
    },

    /// Issue a shareable link for a file
    Share {
        /// File ID
        file_id: FileId,
    },

    /// Revoke a shareable link
    Unshare {
        /// Link token
        token: Option<String>,

        /// Revoke the link of this file instead
        #[arg(long, conflicts_with = "token")]
        file: Option<FileId>,
    },

    /// Open a shareable link
    OpenLink {
        /// Link token
        token: String,
    },
}

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config, cli.verbose) {
        eprintln!("Failed to set up logging: {}", e);
        std::process::exit(1);
    }

    let user = match acting_user(cli.user, cli.role) {
        Ok(user) => user,
        Err(e) => {
            error!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run_command(cli.command, &config_path, config, &user) {
        if e.is_crypto() {
            warn!("Command failed: {}", e);
        }
        error!("Error ({}): {}", e.status_code(), e.public_message());
        std::process::exit(1);
    }
}

fn load_config(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        return Config::load(config_path);
    }

    let mut config = Config::default();
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) if verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new(&config.logging.level),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match &config.logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to install subscriber: {}", e)))
}

fn acting_user(username: Option<String>, role: Role) -> Result<User> {
    let username = username
        .or_else(|| std::env::var("USER").ok())
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| Error::Validation("No user given; pass --user".to_string()))?;
    Ok(User::new(username.trim(), role))
}

fn run_command(command: Commands, config_path: &Path, config: Config, user: &User) -> Result<()> {
    match command {
        Commands::Init { data_dir, force } => cmd_init(config_path, config, data_dir, force),
        Commands::Status => cmd_status(config_path, &config),
        Commands::Upload {
            path,
            key,
            iv,
            name,
        } => cmd_upload(&config, user, &path, &key, &iv, name),
        Commands::Download {
            file_id,
            link,
            render,
            output,
        } => cmd_download(&config, user, file_id, link, render, output),
        Commands::List => cmd_list(&config, user),
        Commands::Show { file_id } => cmd_show(&config, user, file_id),
        Commands::Delete { file_id } => cmd_delete(&config, user, file_id),
        Commands::Grant {
            file_id,
            username,
            download,
        } => cmd_grant(&config, user, file_id, username, download),
        Commands::Revoke { file_id, username } => cmd_revoke(&config, user, file_id, &username),
        Commands::Share { file_id } => cmd_share(&config, user, file_id),
        Commands::Unshare { token, file } => cmd_unshare(&config, user, token, file),
        Commands::OpenLink { token } => cmd_open_link(&config, user, &token),
    }
}

/// Initialize keys and open the vault
fn open_vault(config: &Config) -> Result<FileVault> {
    config.ensure_directories()?;
    let keys = Arc::new(KeyStore::initialize(&config.keys)?);
    FileVault::open(config, keys)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_init(
    config_path: &Path,
    config: Config,
    data_dir: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    info!("Initializing sealvault...");

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{:?} already exists; pass --force to overwrite",
            config_path
        )));
    }

    let config = match data_dir {
        Some(dir) => {
            let mut relocated = Config::with_data_dir(expand_tilde(&dir));
            relocated.sharing = config.sharing;
            relocated.logging = config.logging;
            relocated
        }
        None => config,
    };
    config.validate()?;

    // Ensure config directory exists
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    config.save(config_path)?;
    config.ensure_directories()?;

    let keys = KeyStore::initialize(&config.keys)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);
    info!("Public key fingerprint: {}", keys.public_key_fingerprint()?);

    Ok(())
}

fn cmd_status(config_path: &Path, config: &Config) -> Result<()> {
    println!("sealvault Status");
    println!("================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Data directory: {:?}", config.data_dir);
    println!("Database: {:?}", config.storage.database_path);
    println!("Blob directory: {:?}", config.storage.blob_dir);
    println!("Link lifetime: {} s", config.sharing.link_ttl_secs);

    match KeyStore::load(&config.keys) {
        Ok(keys) => {
            println!("Keys: available");
            println!("Public key fingerprint: {}", keys.public_key_fingerprint()?);
            let vault = FileVault::open(config, Arc::new(keys))?;
            let stats = vault.stats();
            println!("Files: {}", stats.file_count);
            println!("Grants: {}", stats.grant_count);
            println!("Links: {}", stats.link_count);
        }
        Err(e) => {
            println!("Keys: unavailable ({}) - run 'sealvault init'", e);
        }
    }

    Ok(())
}

fn cmd_upload(
    config: &Config,
    user: &User,
    path: &Path,
    key: &str,
    iv: &str,
    name: Option<String>,
) -> Result<()> {
    let name = name
        .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();
    let body = std::fs::read(path)?;

    let vault = open_vault(config)?;
    let file_id = vault.upload(user, &name, &body, key, iv)?;
    vault.flush()?;

    println!("{}", file_id);
    Ok(())
}

fn cmd_download(
    config: &Config,
    user: &User,
    file_id: Option<FileId>,
    link: Option<String>,
    render: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let intent = if render {
        DownloadIntent::Render
    } else {
        DownloadIntent::Save
    };

    let vault = open_vault(config)?;
    let bundle = match (file_id, link) {
        (Some(file_id), _) => vault.download(file_id, user, intent)?,
        (None, Some(token)) => vault.download_via_link(&token, intent)?,
        (None, None) => {
            return Err(Error::Validation(
                "Give a file ID or --link <token>".to_string(),
            ))
        }
    };

    let response = serde_json::to_string_pretty(&bundle.to_response())?;
    match output {
        Some(path) => {
            std::fs::write(&path, response)?;
            info!("Wrote {} to {:?}", bundle.filename, path);
        }
        None => println!("{}", response),
    }
    Ok(())
}

fn cmd_list(config: &Config, user: &User) -> Result<()> {
    let vault = open_vault(config)?;
    print_json(&vault.list_files(user)?)
}

fn cmd_show(config: &Config, user: &User, file_id: FileId) -> Result<()> {
    let vault = open_vault(config)?;
    print_json(&vault.file_details(file_id, user)?)
}

fn cmd_delete(config: &Config, user: &User, file_id: FileId) -> Result<()> {
    let vault = open_vault(config)?;
    vault.delete(file_id, user)?;
    vault.flush()?;
    println!("Deleted file {}", file_id);
    Ok(())
}

fn cmd_grant(
    config: &Config,
    user: &User,
    file_id: FileId,
    username: String,
    download: bool,
) -> Result<()> {
    let vault = open_vault(config)?;
    let request = GrantRequest::new(username).with_download(download);
    let entry = vault.grant_access(file_id, user, &request)?;
    vault.flush()?;
    print_json(&entry)
}

fn cmd_revoke(config: &Config, user: &User, file_id: FileId, username: &str) -> Result<()> {
    let vault = open_vault(config)?;
    vault.revoke_access(file_id, user, username)?;
    vault.flush()?;
    println!("Revoked {} on file {}", username, file_id);
    Ok(())
}

fn cmd_share(config: &Config, user: &User, file_id: FileId) -> Result<()> {
    let vault = open_vault(config)?;
    let link = vault.issue_link(file_id, user)?;
    vault.flush()?;
    print_json(&sealvault::links::LinkView::from(&link))
}

fn cmd_unshare(
    config: &Config,
    user: &User,
    token: Option<String>,
    file: Option<FileId>,
) -> Result<()> {
    let vault = open_vault(config)?;
    match (token, file) {
        (Some(token), _) => vault.links().revoke(&token, user)?,
        (None, Some(file_id)) => {
            if !vault.revoke_file_link(file_id, user)? {
                println!("File {} has no link", file_id);
            }
        }
        (None, None) => {
            return Err(Error::Validation(
                "Give a link token or --file <id>".to_string(),
            ))
        }
    }
    vault.flush()?;
    Ok(())
}

fn cmd_open_link(config: &Config, user: &User, token: &str) -> Result<()> {
    let vault = open_vault(config)?;
    print_json(&vault.open_link(token, user)?)
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
