use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;
mod auth;
use vaultguard::{
    Config, EncryptOptions, EncryptTarget, KdfParams, NewUser, StrengthTier, Vaultguard,
    password_strength, read_hidden_metadata,
};

#[derive(Debug, clap::Args)]
struct Argon2Args {
    /// Argon2 memory cost in KiB (default: 65536)
    #[arg(long = "argon-mem", global = true, env = "VAULTGUARD_ARGON_MEM")]
    mem_cost_kib: Option<u32>,

    /// Argon2 time cost / iterations (default: 3)
    #[arg(long = "argon-time", global = true, env = "VAULTGUARD_ARGON_TIME")]
    time_cost: Option<u32>,

    /// Argon2 parallelism (default: 1)
    #[arg(long = "argon-parallelism", global = true, env = "VAULTGUARD_ARGON_PARALLELISM")]
    parallelism: Option<u32>,
}

impl Argon2Args {
    fn to_kdf_params(&self) -> Result<KdfParams> {
        let default = KdfParams::default();

        Ok(KdfParams::new(
            self.mem_cost_kib.unwrap_or(default.mem_cost_kib()),
            self.time_cost.unwrap_or(default.time_cost()),
            self.parallelism.unwrap_or(default.parallelism()),
        )?)
    }
}

#[derive(Debug, Parser)]
#[command(name = "vaultguard")]
#[command(
    version,
    about = "Offline file encryption with secure deletion and a tamper-evident activity log."
)]
struct Cli {
    /// Directory holding the user store, history and install keys
    #[arg(long, global = true, value_name = "DIR", env = "VAULTGUARD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log in as this user first, so the history names them
    #[arg(long, global = true, value_name = "NAME", env = "VAULTGUARD_USER")]
    user: Option<String>,

    /// Print debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    argon2: Argon2Args,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Encrypts a file into FILE.enc, or in place
    #[command(arg_required_else_help = true)]
    Encrypt {
        file: PathBuf,
        /// Replace the original instead of writing FILE.enc
        #[arg(long)]
        in_place: bool,
        /// Mark the file for one-time decryption
        #[arg(long)]
        one_time: bool,
        /// Embed an owner tag in the clear header
        #[arg(long, value_name = "NAME")]
        owner: Option<String>,
    },

    /// Decrypts a file
    #[command(arg_required_else_help = true)]
    Decrypt {
        file: PathBuf,
        /// Where to write the plaintext (default: FILE without .enc)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Unlock with a time-lock token instead of a password
        #[arg(long)]
        token: Option<String>,
    },

    /// Shows the clear header of an encrypted file
    #[command(arg_required_else_help = true)]
    Inspect { file: PathBuf },

    /// Overwrites and deletes a file or directory tree
    #[command(arg_required_else_help = true)]
    Shred {
        path: PathBuf,
        /// Number of overwrite passes (default: 7)
        #[arg(long)]
        passes: Option<usize>,
    },

    /// Time-lock tokens
    #[command(subcommand)]
    Token(TokenCommand),

    /// The activity log
    #[command(subcommand)]
    History(HistoryCommand),

    /// User accounts
    #[command(subcommand)]
    User(UserCommand),

    /// Rates a password
    Strength { password: Option<String> },

    /// Locks the session and wipes the scratch directory
    Panic,
}

#[derive(Debug, Subcommand)]
enum TokenCommand {
    /// Issues a token for the password, valid for a while
    Issue {
        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        duration: u64,
        /// Copy the token to the clipboard instead of printing it
        #[arg(long)]
        copy: bool,
    },
    /// Checks a token
    #[command(arg_required_else_help = true)]
    Check { token: String },
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    /// Lists entries, newest first
    List {
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Verifies the hash chain
    Verify,
    /// Deletes all entries
    Clear,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    /// Creates an account
    #[command(arg_required_else_help = true)]
    Register {
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        mobile: String,
        #[arg(long, default_value = "")]
        full_name: String,
    },
    /// Checks an account password
    #[command(arg_required_else_help = true)]
    Login { username: String },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Cli::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = resolve_config(args.data_dir.clone(), &args.argon2)?;

    match args.command {
        Commands::Strength { password } => {
            let password = match password {
                Some(pw) => Zeroizing::new(pw),
                None => auth::read_password()?,
            };
            let score = password_strength(&password);
            println!("{score}/100 ({})", StrengthTier::for_score(score));
            Ok(())
        }
        Commands::Inspect { file } => inspect(&file),
        command => {
            if let Commands::Shred {
                passes: Some(passes),
                ..
            } = &command
            {
                config.wipe_passes = *passes;
            }
            let mut vg = Vaultguard::with_install_token_key(config)?;
            if let Some(user) = &args.user {
                let pw = auth::read_account_password(user)?;
                vg.login(user, &pw)?;
            }
            run(command, &mut vg)
        }
    }
}

fn run(command: Commands, vg: &mut Vaultguard) -> Result<()> {
    match command {
        Commands::Encrypt {
            file,
            in_place,
            one_time,
            owner,
        } => {
            let password = auth::read_password()?;
            let mut options = EncryptOptions::default();
            if one_time {
                options = options.one_time();
            }
            if let Some(owner) = owner {
                options = options.owner(owner);
            }
            let target = if in_place {
                EncryptTarget::InPlace
            } else {
                EncryptTarget::NewFile
            };
            let dest = vg.encrypt(&file, &password, target, &options)?;
            println!("encrypted '{}'", dest.display());
        }
        Commands::Decrypt {
            file,
            output,
            token,
        } => {
            let outcome = match token {
                Some(token) => vg.decrypt_with_token(&file, &token, output.as_deref())?,
                None => {
                    let password = auth::read_password()?;
                    vg.decrypt(&file, &password, output.as_deref())?
                }
            };
            println!("decrypted to '{}'", outcome.output_path.display());
            if outcome.one_time_decrypt {
                println!("note: this file was marked one-time-decrypt; shred the output when done");
            }
        }
        Commands::Shred { path, .. } => {
            if path.is_dir() {
                let report = vg.secure_delete_tree(&path)?;
                println!("wiped {} file(s)", report.wiped.len());
                for (p, e) in &report.failures {
                    eprintln!("failed: '{}': {e}", p.display());
                }
                if !report.is_complete() {
                    bail!("partial wipe of '{}'", path.display());
                }
            } else {
                vg.secure_delete(&path)?;
                println!("shredded '{}'", path.display());
            }
        }
        Commands::Token(TokenCommand::Issue { duration, copy }) => {
            let password = auth::read_password()?;
            let (token, expiry) = vg.tokens().issue(&password, duration)?;
            if copy {
                let mut clipboard =
                    arboard::Clipboard::new().context("clipboard is not available")?;
                clipboard
                    .set_text(token)
                    .context("failed to copy token to clipboard")?;
                println!("token copied to clipboard");
            } else {
                println!("{token}");
            }
            println!("expires {}", format_unix(expiry));
        }
        Commands::Token(TokenCommand::Check { token }) => {
            vg.tokens().validate(&token)?;
            println!("token is valid");
        }
        Commands::History(HistoryCommand::List { limit }) => {
            let entries: Vec<_> = vg
                .history()
                .recent()
                .take(limit.unwrap_or(usize::MAX))
                .collect();
            if entries.is_empty() {
                println!("No history.");
                return Ok(());
            }

            let file_width = entries
                .iter()
                .map(|e| e.filename.len())
                .chain(std::iter::once("File".len()))
                .max()
                .unwrap_or_default();

            println!(
                "{:<19}  {:<13}  {:<7}  {:<file_width$}  User",
                "Time", "Action", "Status", "File"
            );
            println!("{:-<19}  {:-<13}  {:-<7}  {:-<file_width$}  ----", "", "", "", "");
            for e in entries {
                println!(
                    "{:<19}  {:<13}  {:<7}  {:<file_width$}  {}",
                    e.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
                    format!("{:?}", e.action),
                    format!("{:?}", e.status),
                    e.filename,
                    e.user,
                );
            }
        }
        Commands::History(HistoryCommand::Verify) => {
            vg.history().verify_intact()?;
            let count = vg.history().len();
            match vg.history().anchor() {
                Some(anchor) => println!(
                    "chain intact: {count} entries ({} trimmed earlier)",
                    anchor.trimmed
                ),
                None => println!("chain intact: {count} entries"),
            }
        }
        Commands::History(HistoryCommand::Clear) => {
            vg.history_mut().clear()?;
            println!("history cleared");
        }
        Commands::User(UserCommand::Register {
            username,
            email,
            mobile,
            full_name,
        }) => {
            let password = auth::read_new_password_with_confirmation()?;
            vg.users_mut().register(NewUser {
                username: &username,
                password: &password,
                email: &email,
                mobile: &mobile,
                full_name: &full_name,
            })?;
            println!("user '{username}' registered");
        }
        Commands::User(UserCommand::Login { username }) => {
            let password = auth::read_password()?;
            vg.login(&username, &password)?;
            println!("login ok: {username}");
        }
        Commands::Panic => {
            let report = vg.panic_lock();
            println!("session locked; wiped {} temp file(s)", report.wiped.len());
            if !report.is_complete() {
                bail!("{} temp path(s) could not be wiped", report.failures.len());
            }
        }
        Commands::Strength { .. } | Commands::Inspect { .. } => {}
    }

    Ok(())
}

fn resolve_config(data_dir: Option<PathBuf>, argon2: &Argon2Args) -> Result<Config> {
    let config = match data_dir {
        Some(dir) => Config::from_dir(dir),
        None => Config::default_location()?,
    };
    Ok(config.with_kdf(argon2.to_kdf_params()?))
}

fn inspect(file: &Path) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("failed to read '{}'", file.display()))?;
    let container = vaultguard::format::parse(&data)?;

    println!("algorithm:   {}", vaultguard::crypto::ALGORITHM);
    println!("one-time:    {}", container.one_time_decrypt());
    println!("ciphertext:  {} bytes", container.ciphertext().len());
    match read_hidden_metadata(file) {
        Some(meta) => {
            println!("owner:       {}", meta.owner);
            println!("created:     {}", format_unix(meta.ts));
        }
        None => println!("owner:       (none)"),
    }
    Ok(())
}

fn format_unix(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0).single() {
        Some(t) => DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => secs.to_string(),
    }
}
