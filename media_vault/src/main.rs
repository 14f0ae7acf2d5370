//! Media Vault - CLI
//!
//! Command-line interface for vault operations.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;
use zeroize::Zeroizing;

use media_vault::{
    BackupPackager, BlobRole, CancelFlag, MediaVault, PasswordChange, ProgressReporter, UnlockOutcome,
};

#[derive(Parser)]
#[command(name = "media-vault")]
#[command(version = media_vault::VERSION)]
#[command(about = "Media Vault - encrypted photo and video storage")]
struct Cli {
    /// Vault path
    #[arg(short, long, default_value = "./vault")]
    vault: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Primary,
    Thumbnail,
    VideoPreview,
}

impl From<Role> for BlobRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Primary => BlobRole::Primary,
            Role::Thumbnail => BlobRole::Thumbnail,
            Role::VideoPreview => BlobRole::VideoPreview,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault
    Init {
        #[arg(short, long)]
        password: String,
    },

    /// Check the password (migrates legacy blobs if configured)
    Unlock {
        #[arg(short, long)]
        password: String,
    },

    /// Import a file as a new item
    Import {
        path: PathBuf,

        #[arg(short, long)]
        password: String,
    },

    /// Decrypt an item rendition to a file
    Export {
        /// Item UUID
        id: Uuid,

        /// Output path
        output: PathBuf,

        #[arg(short, long, value_enum, default_value = "primary")]
        role: Role,

        #[arg(short, long)]
        password: String,
    },

    /// Delete every rendition of an item
    Delete {
        id: Uuid,

        #[arg(short, long)]
        password: String,
    },

    /// List stored blobs
    List,

    /// Re-encrypt the vault under a new password
    ChangePassword {
        #[arg(short, long)]
        password: String,

        #[arg(long)]
        new_password: String,
    },

    /// Write a backup archive
    Backup { output: PathBuf },

    /// Merge a backup archive into the vault
    Restore {
        archive: PathBuf,

        /// Replace blobs that already exist
        #[arg(long)]
        overwrite: bool,

        /// Reject entries that do not decrypt under this vault's key
        #[arg(long)]
        password: Option<String>,
    },

    /// Show a backup archive's manifest
    Inspect { archive: PathBuf },

    /// Rewrite legacy-format blobs
    Migrate {
        #[arg(short, long)]
        password: String,
    },

    /// Authenticate every blob
    Verify {
        #[arg(short, long)]
        password: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn open_unlocked(path: &Path, password: &str) -> anyhow::Result<MediaVault> {
    let vault = MediaVault::open(path)?;
    match vault.unlock(password)? {
        UnlockOutcome::Unlocked { migrated } => {
            if migrated > 0 {
                println!("Migrated {} legacy blob(s)", migrated);
            }
            Ok(vault)
        }
        UnlockOutcome::WrongPassword => bail!("wrong password"),
        UnlockOutcome::VaultUninitialized => bail!("vault at {} is not initialized", path.display()),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init { password } => {
            MediaVault::create(&cli.vault, &password)?;
            println!("Vault created at: {}", cli.vault.display());
        }

        Commands::Unlock { password } => {
            open_unlocked(&cli.vault, &password)?;
            println!("Vault unlocked");
        }

        Commands::Import { path, password } => {
            let vault = open_unlocked(&cli.vault, &password)?;
            let id = vault
                .import_file(&path)
                .with_context(|| format!("importing {}", path.display()))?;
            println!("Imported with ID: {}", id);
        }

        Commands::Export {
            id,
            output,
            role,
            password,
        } => {
            let vault = open_unlocked(&cli.vault, &password)?;
            let data = vault.read_item(id, role.into())?;
            std::fs::write(&output, &data[..])?;
            println!("Exported to: {}", output.display());
        }

        Commands::Delete { id, password } => {
            let vault = open_unlocked(&cli.vault, &password)?;
            vault.delete_item(id)?;
            println!("Deleted {}", id);
        }

        Commands::List => {
            let vault = MediaVault::open(&cli.vault)?;
            let blobs = vault.list_blobs()?;

            if blobs.is_empty() {
                println!("No blobs in vault");
            } else {
                println!("Blobs in vault ({}):", blobs.len());
                println!("{:-<60}", "");
                for blob in blobs {
                    println!("{}", blob);
                }
            }
        }

        Commands::ChangePassword {
            password,
            new_password,
        } => {
            let vault = Arc::new(open_unlocked(&cli.vault, &password)?);
            let (reporter, mut watch) = ProgressReporter::channel();

            let printer = tokio::spawn(async move {
                while let Some(progress) = watch.changed().await {
                    print!("\rRe-encrypting {}/{}", progress.processed, progress.total);
                    let _ = std::io::stdout().flush();
                }
                println!();
            });

            let outcome = vault
                .change_password_async(
                    Zeroizing::new(password),
                    Zeroizing::new(new_password),
                    reporter,
                    CancelFlag::new(),
                )
                .await;
            let _ = printer.await;

            match outcome? {
                PasswordChange::Completed { rewritten } => {
                    println!("Password changed, {} blob(s) re-encrypted", rewritten)
                }
                PasswordChange::WrongOldPassword => bail!("wrong password"),
                PasswordChange::Failed(reason) => bail!("{}", reason),
            }
        }

        Commands::Backup { output } => {
            let vault = MediaVault::open(&cli.vault)?;
            let count = vault.export_backup(&output)?;
            println!("Backed up {} blob(s) to {}", count, output.display());
        }

        Commands::Restore {
            archive,
            overwrite,
            password,
        } => {
            let result = match password {
                Some(password) => {
                    let vault = open_unlocked(&cli.vault, &password)?;
                    vault.import_backup(&archive, overwrite, true)?
                }
                None => MediaVault::open(&cli.vault)?.import_backup(&archive, overwrite, false)?,
            };
            println!(
                "Restore complete: {} imported, {} skipped, {} rejected",
                result.imported, result.skipped, result.rejected
            );
        }

        Commands::Inspect { archive } => {
            let manifest = BackupPackager::inspect(&archive)?;
            println!("Backup format version: {}", manifest.version);
            println!("Entries:               {}", manifest.entry_count);
            if let Some(created) = manifest.created_at {
                println!("Created:               {}", created.to_rfc3339());
            }
        }

        Commands::Migrate { password } => {
            let vault = MediaVault::open(&cli.vault)?;
            if let UnlockOutcome::WrongPassword = vault.unlock(&password)? {
                bail!("wrong password");
            }
            let report = vault.migrate_legacy(&password)?;
            println!("Migrated {} of {} legacy blob(s)", report.processed, report.total);
            if report.skipped > 0 {
                println!("Skipped {} unreadable blob(s), see `verify`", report.skipped);
            }
        }

        Commands::Verify { password } => {
            let vault = open_unlocked(&cli.vault, &password)?;
            let report = vault.verify_all()?;

            println!("Checked {} blob(s)", report.checked);
            if report.is_clean() {
                println!("All blobs authenticate");
            } else {
                for (blob, error) in &report.failed {
                    println!("  {} - {}", blob, error);
                }
                bail!("{} blob(s) failed verification", report.failed.len());
            }
        }
    }

    Ok(())
}
