//! qds: closed-group file encryption CLI
//!
//! Commands:
//!   keygen <out> --users N     - generate a password-wrapped key bundle
//!   encrypt <input>            - encrypt a file into an artifact
//!   decrypt <artifact>         - verify and decrypt an artifact
//!   inspect <artifact>         - show authenticated artifact metadata
//!   status                     - load the bundle and show remaining keys
//!   config show                - display current configuration
//!
//! Every invocation starts with an empty key store and loads the bundle
//! fresh, so session-key consumption is not remembered between runs:
//! session keys are always picked by explicit index.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use qds_core::config::{expand_tilde, QdsConfig, DEFAULT_CONFIG_PATH};
use qds_core::{open_key_store, resolve_bundle_path};
use qds_crypto::container::HEADER_SIZE;
use qds_crypto::{
    decrypt_artifact_cancellable, derive_master_key, encrypt_artifact_cancellable,
    generate_bundle, inspect_artifact, Aes256Cipher, ArtifactHeader, ArtifactMeta, CryptoResult,
    FileType, KeySelector, KeyStore, KeyType, SessionPick,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "qds",
    version,
    about = "Closed-group file encryption with shared circle keys and one-time session keys"
)]
struct Cli {
    /// Path to config.toml
    #[arg(long, short = 'c', env = "QDS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, env = "QDS_LOG")]
    log: Option<String>,

    /// Log format; overrides [log] format
    #[arg(long, env = "QDS_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Args, Debug, Clone)]
struct BundleArg {
    /// Key bundle file (overrides [keys] bundle)
    #[arg(long, short = 'k', env = "QDS_BUNDLE")]
    bundle: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new key bundle with fresh random keys
    Keygen {
        /// Output bundle path
        out: PathBuf,
        /// Number of members (session-key batches), 1..=255
        #[arg(long, short = 'u', default_value_t = 1)]
        users: usize,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Encrypt a file into an authenticated artifact
    Encrypt {
        input: PathBuf,
        /// Output artifact path (default: <input>.qds)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        #[command(flatten)]
        bundle: BundleArg,
        /// Use circle key slot N (0..10)
        #[arg(long, conflicts_with = "session")]
        circle: Option<u8>,
        /// Use session key slot N (0..100) of the front batch
        #[arg(long)]
        session: Option<u8>,
        /// Content type recorded in the header (file, photo, text, audio)
        #[arg(long = "type", short = 't', default_value = "file")]
        file_type: FileType,
        /// Sender number (overrides [container] user_number)
        #[arg(long)]
        user: Option<u8>,
        /// Filename to embed (default: input file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Verify and decrypt an artifact
    Decrypt {
        artifact: PathBuf,
        /// Directory for the decrypted file (overrides [container] output_dir)
        #[arg(long, short = 'o')]
        out_dir: Option<PathBuf>,
        #[command(flatten)]
        bundle: BundleArg,
        /// Overwrite an existing output file
        #[arg(long)]
        force: bool,
    },

    /// Verify an artifact and show its metadata without consuming keys
    Inspect {
        artifact: PathBuf,
        #[command(flatten)]
        bundle: BundleArg,
        #[arg(long)]
        json: bool,
    },

    /// Load the key bundle and show what it holds
    Status {
        #[command(flatten)]
        bundle: BundleArg,
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Display the current configuration
    Show,
}

// ── Entry point ────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);

    let config = QdsConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "qds starting"
    );

    match cli.command {
        Commands::Keygen { out, users, force } => {
            let password = read_password(true)?;
            cmd_keygen(&out, users, force, &password).await
        }
        Commands::Encrypt {
            input,
            out,
            bundle,
            circle,
            session,
            file_type,
            user,
            name,
        } => {
            let selector = resolve_selector(&config, circle, session)?;
            let meta = ArtifactMeta {
                user_number: user.unwrap_or(config.container.user_number),
                file_type,
                filename: name.or_else(|| {
                    input
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                }),
            };
            let bundle = resolve_bundle(&config, &bundle)?;
            let password = read_password(false)?;
            let out = out.unwrap_or_else(|| default_artifact_path(&input));
            cmd_encrypt(&config, &bundle, &password, &input, &out, selector, meta).await
        }
        Commands::Decrypt {
            artifact,
            out_dir,
            bundle,
            force,
        } => {
            let bundle = resolve_bundle(&config, &bundle)?;
            let password = read_password(false)?;
            let out_dir = out_dir
                .or_else(|| config.container.output_dir.as_deref().map(expand_tilde))
                .unwrap_or_else(|| parent_dir(&artifact));
            cmd_decrypt(&config, &bundle, &password, &artifact, &out_dir, force).await
        }
        Commands::Inspect {
            artifact,
            bundle,
            json,
        } => {
            let bundle = resolve_bundle(&config, &bundle)?;
            let password = read_password(false)?;
            cmd_inspect(&bundle, &password, &artifact, json).await
        }
        Commands::Status { bundle, json } => {
            let bundle = resolve_bundle(&config, &bundle)?;
            let password = read_password(false)?;
            cmd_status(&bundle, &password, json).await
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output (and --json); logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Shared helpers ─────────────────────────────────────────────────────────────

/// Password from `QDS_PASSWORD`, else an interactive no-echo prompt.
fn read_password(confirm: bool) -> Result<SecretString> {
    if let Ok(pw) = std::env::var("QDS_PASSWORD") {
        return Ok(SecretString::from(pw));
    }

    let pw = rpassword::prompt_password("Password: ").context("reading password")?;
    if confirm {
        if pw.is_empty() {
            anyhow::bail!("refusing to seal a bundle with an empty password");
        }
        let again = rpassword::prompt_password("Repeat password: ").context("reading password")?;
        if again != pw {
            anyhow::bail!("passwords do not match");
        }
    }
    Ok(SecretString::from(pw))
}

/// Bundle path: CLI flag > config > error
fn resolve_bundle(config: &QdsConfig, arg: &BundleArg) -> Result<PathBuf> {
    Ok(resolve_bundle_path(config, arg.bundle.as_deref())?)
}

/// Key choice: explicit flag > config default
fn resolve_selector(
    config: &QdsConfig,
    circle: Option<u8>,
    session: Option<u8>,
) -> Result<KeySelector> {
    match (circle, session) {
        (Some(index), _) => Ok(KeySelector::Circle(index)),
        (None, Some(index)) => Ok(KeySelector::Session(SessionPick::Indexed(index))),
        (None, None) => match config.container.default_key {
            KeyType::Circle => Ok(KeySelector::Circle(config.container.circle_index)),
            KeyType::Session => anyhow::bail!(
                "default_key is \"session\" but no --session <INDEX> was given; \
                 session-key use is not tracked between runs, pick the slot explicitly"
            ),
        },
    }
}

fn default_artifact_path(input: &Path) -> PathBuf {
    let mut s = input.as_os_str().to_owned();
    s.push(".qds");
    PathBuf::from(s)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn load_store(bundle: &Path, password: &SecretString) -> Result<KeyStore> {
    open_key_store(bundle, password)
        .with_context(|| format!("loading key bundle: {}", bundle.display()))
}

/// Run a blocking crypto job off the async runtime; Ctrl-C cancels it.
async fn run_cancellable<T, F>(job: F) -> Result<T>
where
    F: FnOnce(CancellationToken) -> CryptoResult<T> + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancellationToken::new();
    let worker_token = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || job(worker_token));

    let result = tokio::select! {
        res = &mut handle => res,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, cancelling");
            cancel.cancel();
            handle.await
        }
    };
    Ok(result.context("crypto worker failed")??)
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn describe_key(header: &ArtifactHeader) -> String {
    format!("{} #{}", header.key_type, header.key_index())
}

// ── `qds keygen` ──────────────────────────────────────────────────────────────

async fn cmd_keygen(out: &Path, users: usize, force: bool, password: &SecretString) -> Result<()> {
    if out.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", out.display());
    }

    let pw = password.clone();
    let bundle = run_cancellable(move |_| generate_bundle::<Aes256Cipher>(&pw, users))
        .await
        .context("generating key bundle")?;

    tokio::fs::write(out, &bundle)
        .await
        .with_context(|| format!("writing key bundle: {}", out.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(out, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("restricting permissions: {}", out.display()))?;
    }

    info!(path = %out.display(), users, "key bundle written");
    println!("Key bundle written: {}", out.display());
    println!("  members:      {users}");
    println!("  size:         {}", fmt_bytes(bundle.len() as u64));
    println!("  fingerprint:  {}", derive_master_key(password).fingerprint());
    Ok(())
}

// ── `qds encrypt` ─────────────────────────────────────────────────────────────

async fn cmd_encrypt(
    config: &QdsConfig,
    bundle: &Path,
    password: &SecretString,
    input: &Path,
    out: &Path,
    selector: KeySelector,
    meta: ArtifactMeta,
) -> Result<()> {
    let store = Arc::new(load_store(bundle, password)?);
    let data = tokio::fs::read(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let plaintext_len = data.len() as u64;
    let chunk_size = config.worker.chunk_size();

    let pb = make_spinner("encrypt");
    pb.set_message(input.display().to_string());
    let job_store = Arc::clone(&store);
    let artifact = run_cancellable(move |cancel| {
        encrypt_artifact_cancellable(&job_store, &data, selector, &meta, chunk_size, &cancel)
    })
    .await;
    pb.finish_and_clear();
    let artifact = artifact.with_context(|| format!("encrypting {}", input.display()))?;

    let header_bytes: [u8; HEADER_SIZE] = artifact[..HEADER_SIZE]
        .try_into()
        .context("artifact shorter than its header")?;
    let header = ArtifactHeader::decode(&header_bytes)?;

    tokio::fs::write(out, &artifact)
        .await
        .with_context(|| format!("writing {}", out.display()))?;

    println!("Encrypted {} → {}", input.display(), out.display());
    println!("  key:      {}", describe_key(&header));
    println!("  type:     {}", header.file_type);
    println!("  size:     {}", fmt_bytes(plaintext_len));
    if header.key_type == KeyType::Session {
        println!("  note:     session key #{} must not be used again", header.session_index);
    }
    Ok(())
}

// ── `qds decrypt` ─────────────────────────────────────────────────────────────

async fn cmd_decrypt(
    config: &QdsConfig,
    bundle: &Path,
    password: &SecretString,
    artifact: &Path,
    out_dir: &Path,
    force: bool,
) -> Result<()> {
    let store = Arc::new(load_store(bundle, password)?);
    let data = tokio::fs::read(artifact)
        .await
        .with_context(|| format!("reading {}", artifact.display()))?;
    let chunk_size = config.worker.chunk_size();

    let pb = make_spinner("decrypt");
    pb.set_message(artifact.display().to_string());
    let job_store = Arc::clone(&store);
    let result = run_cancellable(move |cancel| {
        decrypt_artifact_cancellable(&job_store, &data, chunk_size, &cancel)
    })
    .await;
    pb.finish_and_clear();
    let decrypted = result.with_context(|| format!("decrypting {}", artifact.display()))?;

    if let Some(recovered) = &decrypted.recovered {
        warn!(error = %recovered, "name header unusable, decoded with legacy layout");
    }

    let out = out_dir.join(&decrypted.filename);
    if out.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", out.display());
    }
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;
    tokio::fs::write(&out, &decrypted.plaintext)
        .await
        .with_context(|| format!("writing {}", out.display()))?;

    let header = &decrypted.header;
    println!("Decrypted {} → {}", artifact.display(), out.display());
    println!("  sender:   user {}", header.user_number);
    println!("  key:      {}", describe_key(header));
    println!("  type:     {}", header.file_type);
    println!("  size:     {}", fmt_bytes(decrypted.plaintext.len() as u64));
    if decrypted.recovered.is_some() {
        println!("  note:     legacy layout, original filename unavailable");
    }
    Ok(())
}

// ── `qds inspect` ─────────────────────────────────────────────────────────────

async fn cmd_inspect(
    bundle: &Path,
    password: &SecretString,
    artifact: &Path,
    json: bool,
) -> Result<()> {
    let store = load_store(bundle, password)?;
    let data = tokio::fs::read(artifact)
        .await
        .with_context(|| format!("reading {}", artifact.display()))?;

    let info = inspect_artifact(&store, &data)
        .with_context(|| format!("verifying {}", artifact.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info).context("serializing artifact info")?
        );
        return Ok(());
    }

    println!("Artifact: {} (integrity OK)", artifact.display());
    println!("  sender:      user {}", info.header.user_number);
    println!("  type:        {}", info.header.file_type);
    println!("  key:         {}", describe_key(&info.header));
    match &info.filename {
        Some(name) => println!("  filename:    {name}"),
        None => println!("  filename:    (none)"),
    }
    match info.original_size {
        Some(size) => println!("  size:        {}", fmt_bytes(size)),
        None => println!("  size:        {}", fmt_bytes(info.ciphertext_len as u64)),
    }
    if info.legacy_layout {
        println!("  layout:      legacy (name header unusable; decrypt will use a default filename)");
    }
    println!("  total:       {}", fmt_bytes(info.total_len as u64));
    Ok(())
}

// ── `qds status` ──────────────────────────────────────────────────────────────

async fn cmd_status(bundle: &Path, password: &SecretString, json: bool) -> Result<()> {
    let store = load_store(bundle, password)?;
    let status = store.status();
    let fingerprint = derive_master_key(password).fingerprint();

    if json {
        let out = serde_json::json!({
            "bundle": bundle.display().to_string(),
            "fingerprint": fingerprint,
            "status": status,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&out).context("serializing status")?
        );
        return Ok(());
    }

    println!("Key bundle: {}", bundle.display());
    println!("  fingerprint:       {fingerprint}");
    println!(
        "  circle keys:       {}",
        if status.circle_loaded { "loaded" } else { "missing" }
    );
    println!("  session batches:   {}", status.session_batches);
    println!("  keys left (front): {}", status.front_batch_remaining);
    println!("  keys left (total): {}", status.session_keys_remaining);
    Ok(())
}

// ── `qds config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &QdsConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
