//! NoteVault CLI - Command line interface for the encrypted note vault.
//!
//! Every command opens the vault database, unlocks it, runs one operation
//! and locks again.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

use notevault_common::NoteId;
use notevault_storage::{parse_tags, Note, NoteContent, NoteUpdate};
use notevault_vault::{NoteQuery, VaultManager, VaultSettings};

const PASSWORD_ENV: &str = "NOTEVAULT_PASSWORD";

#[derive(Parser)]
#[command(name = "notevault")]
#[command(about = "NoteVault - Encrypted notes")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Vault database (default: <data dir>/notevault/vault.db).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON settings file.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault.
    Init,

    /// Add a note.
    Add {
        /// Note text.
        content: String,

        /// Comma separated tags.
        #[arg(short, long, default_value = "")]
        tags: String,

        /// Display color.
        #[arg(short, long)]
        color: Option<String>,
    },

    /// List notes.
    List {
        /// Case-insensitive text to look for in content and tags.
        #[arg(short, long)]
        search: Option<String>,

        /// Only notes with this tag.
        #[arg(short, long)]
        tag: Option<String>,

        /// Include archived notes.
        #[arg(short, long)]
        archived: bool,
    },

    /// Print one note.
    Show { id: String },

    /// Change a note.
    Edit {
        id: String,

        /// New text.
        #[arg(long)]
        content: Option<String>,

        /// New comma separated tags.
        #[arg(long)]
        tags: Option<String>,

        /// New display color.
        #[arg(long, conflicts_with = "no_color")]
        color: Option<String>,

        /// Remove the display color.
        #[arg(long)]
        no_color: bool,
    },

    /// Toggle the archived flag.
    Archive { id: String },

    /// Toggle the pinned flag.
    Pin { id: String },

    /// Delete a note.
    Delete { id: String },

    /// Write an encrypted backup.
    Export {
        /// Output file.
        file: PathBuf,
    },

    /// Replace the vault with an encrypted backup.
    Import {
        /// Backup file.
        file: PathBuf,
    },

    /// Show operations waiting to be synced.
    Pending,

    /// Show vault status.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = match &cli.settings {
        Some(path) => VaultSettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => VaultSettings::default(),
    };
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };
    let vault = VaultManager::open(&db_path, settings)
        .with_context(|| format!("Failed to open vault database {}", db_path.display()))?;

    match cli.command {
        Commands::Init => cmd_init(&vault, &db_path),
        Commands::Add {
            content,
            tags,
            color,
        } => cmd_add(&vault, &content, &tags, color),
        Commands::List {
            search,
            tag,
            archived,
        } => cmd_list(
            &vault,
            &NoteQuery {
                search,
                tag,
                include_archived: archived,
            },
        ),
        Commands::Show { id } => cmd_show(&vault, &id),
        Commands::Edit {
            id,
            content,
            tags,
            color,
            no_color,
        } => {
            let update = NoteUpdate {
                content,
                tags: tags.as_deref().map(parse_tags),
                color: if no_color { Some(None) } else { color.map(Some) },
                ..NoteUpdate::default()
            };
            cmd_edit(&vault, &id, update)
        }
        Commands::Archive { id } => cmd_archive(&vault, &id),
        Commands::Pin { id } => cmd_pin(&vault, &id),
        Commands::Delete { id } => cmd_delete(&vault, &id),
        Commands::Export { file } => cmd_export(&vault, &file),
        Commands::Import { file } => cmd_import(&vault, &file),
        Commands::Pending => cmd_pending(&vault),
        Commands::Status => cmd_status(&vault, &db_path),
    }
}

fn default_db_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("No data directory on this platform")?;
    Ok(data_dir.join("notevault").join("vault.db"))
}

/// Read the password from the environment or prompt for it.
fn read_password(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(Zeroizing::new(password.into_bytes()));
    }
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password.into_bytes()))
}

fn unlock(vault: &VaultManager) -> Result<()> {
    if !vault.has_vault()? {
        anyhow::bail!("No vault yet. Run `notevault init` first");
    }
    let password = read_password("Enter password: ")?;
    let summary = vault
        .create_or_unlock(b"", &password)
        .context("Failed to unlock vault")?;
    if summary.hydrated > 0 {
        println!("Restored {} notes from imported backup.", summary.hydrated);
    }
    Ok(())
}

fn parse_id(id: &str) -> Result<NoteId> {
    NoteId::new(id).context("Invalid note id")
}

fn print_summary(note: &Note) {
    let mut flags = String::new();
    if note.pinned {
        flags.push('P');
    }
    if note.archived {
        flags.push('A');
    }
    let first_line = match &note.content {
        NoteContent::Text(text) => text.lines().next().unwrap_or_default().to_string(),
        NoteContent::Undecryptable => "<undecryptable>".to_string(),
    };
    let tags: Vec<&str> = note.tags.iter().map(String::as_str).collect();
    println!(
        "{:<36} {:<2} {} [{}]",
        note.id.as_str(),
        flags,
        first_line,
        tags.join(", ")
    );
}

fn cmd_init(vault: &VaultManager, db_path: &Path) -> Result<()> {
    if vault.has_vault()? {
        anyhow::bail!("A vault already exists at {}", db_path.display());
    }

    let password = read_password("Enter password: ")?;
    let confirm = if std::env::var(PASSWORD_ENV).is_ok() {
        password.clone()
    } else {
        read_password("Confirm password: ")?
    };

    vault
        .create_or_unlock(&confirm, &password)
        .context("Failed to create vault")?;
    vault.lock();

    println!("Vault created at {}", db_path.display());
    Ok(())
}

fn cmd_add(vault: &VaultManager, content: &str, tags: &str, color: Option<String>) -> Result<()> {
    unlock(vault)?;
    let note = vault
        .add_note(content, parse_tags(tags), color)
        .context("Failed to add note")?;
    vault.lock();

    println!("Note added: {}", note.id);
    Ok(())
}

fn cmd_list(vault: &VaultManager, query: &NoteQuery) -> Result<()> {
    unlock(vault)?;
    let notes = vault.search_notes(query).context("Failed to list notes")?;
    vault.lock();

    if notes.is_empty() {
        println!("No notes.");
    } else {
        for note in &notes {
            print_summary(note);
        }
    }
    Ok(())
}

fn cmd_show(vault: &VaultManager, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    unlock(vault)?;
    let note = vault.get_note(&id).context("Failed to read note")?;
    vault.lock();

    println!("ID:       {}", note.id);
    println!("Created:  {}", note.created_at);
    println!("Updated:  {}", note.updated_at);
    if !note.tags.is_empty() {
        let tags: Vec<&str> = note.tags.iter().map(String::as_str).collect();
        println!("Tags:     {}", tags.join(", "));
    }
    if let Some(color) = &note.color {
        println!("Color:    {}", color);
    }
    println!("Pinned:   {}", note.pinned);
    println!("Archived: {}", note.archived);
    println!("Synced:   {}", note.synced);
    println!();
    match &note.content {
        NoteContent::Text(text) => println!("{}", text),
        NoteContent::Undecryptable => println!("<undecryptable>"),
    }
    Ok(())
}

fn cmd_edit(vault: &VaultManager, id: &str, update: NoteUpdate) -> Result<()> {
    let id = parse_id(id)?;
    if update.is_empty() {
        anyhow::bail!("Nothing to change");
    }
    unlock(vault)?;
    vault.edit_note(&id, update).context("Failed to edit note")?;
    vault.lock();

    println!("Note updated: {}", id);
    Ok(())
}

fn cmd_archive(vault: &VaultManager, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    unlock(vault)?;
    let note = vault.toggle_archive(&id).context("Failed to archive note")?;
    vault.lock();

    println!(
        "Note {}: {}",
        if note.archived { "archived" } else { "restored" },
        id
    );
    Ok(())
}

fn cmd_pin(vault: &VaultManager, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    unlock(vault)?;
    let note = vault.toggle_pin(&id).context("Failed to pin note")?;
    vault.lock();

    println!(
        "Note {}: {}",
        if note.pinned { "pinned" } else { "unpinned" },
        id
    );
    Ok(())
}

fn cmd_delete(vault: &VaultManager, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    unlock(vault)?;
    let removed = vault.delete_note(&id).context("Failed to delete note")?;
    vault.lock();

    if removed {
        println!("Note deleted: {}", id);
    } else {
        println!("No note with id {}", id);
    }
    Ok(())
}

fn cmd_export(vault: &VaultManager, file: &Path) -> Result<()> {
    info!("Exporting backup to {}", file.display());
    unlock(vault)?;
    let password = read_password("Re-enter password to export: ")?;
    let backup = vault
        .export_backup(&password)
        .context("Failed to export backup")?;
    vault.lock();

    std::fs::write(file, &backup).context("Failed to write backup file")?;
    println!("Backup written: {} ({} bytes)", file.display(), backup.len());
    Ok(())
}

fn cmd_import(vault: &VaultManager, file: &Path) -> Result<()> {
    info!("Importing backup from {}", file.display());
    let bytes = std::fs::read(file).context("Failed to read backup file")?;
    let removed = vault
        .import_backup(&bytes)
        .context("Failed to import backup")?;

    println!("Backup imported; {} local notes replaced.", removed);
    println!("Unlock with the backup's password to restore its notes.");
    Ok(())
}

fn cmd_pending(vault: &VaultManager) -> Result<()> {
    let ops = vault
        .pending_operations()
        .context("Failed to read sync queue")?;

    if ops.is_empty() {
        println!("Nothing to sync.");
    } else {
        for op in &ops {
            println!(
                "{}  {:<6} {}  {}",
                op.timestamp,
                op.op_type.as_str(),
                op.note_id,
                op.id
            );
        }
    }
    Ok(())
}

fn cmd_status(vault: &VaultManager, db_path: &Path) -> Result<()> {
    let settings = vault.settings();

    println!("Vault Information:");
    println!("  Database: {}", db_path.display());
    println!("  Initialized: {}", vault.has_vault()?);
    println!("  Pending operations: {}", vault.pending_operations()?.len());
    println!("  Cipher: {:?}", settings.aead);
    println!("  KDF: {:?}, {} iterations", settings.kdf.algorithm, settings.kdf.iterations);
    println!("  Auto-lock: {} s", settings.auto_lock_timeout_ms / 1000);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_edit_flags() {
        let cli = Cli::parse_from(["notevault", "edit", "abc", "--tags", "a,b", "--no-color"]);
        match cli.command {
            Commands::Edit {
                id, tags, no_color, ..
            } => {
                assert_eq!(id, "abc");
                assert_eq!(tags.as_deref(), Some("a,b"));
                assert!(no_color);
            }
            _ => panic!("expected edit"),
        }
    }
}
