use std::io::Write;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use linkshelf_sync::{
    DeleteOutcome, Draft, InsertOutcome, MirrorSnapshot, OwnerId, RecordId, SessionController,
};
use serde_json::{Value, json};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "linkshelf")]
#[command(about = "Linkshelf bookmark mirror CLI")]
pub struct LinkshelfCli {
    /// Signed-in owner (user UUID).
    #[arg(long, global = true, value_parser = parse_owner)]
    pub owner: Option<OwnerId>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the owner's bookmarks, newest first
    List,
    /// Create a bookmark
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        url: String,
    },
    /// Delete a bookmark by id
    Delete { id: i64 },
    /// Print every mirror snapshot as a JSON line until Ctrl-C
    Watch,
}

fn parse_owner(value: &str) -> Result<OwnerId, String> {
    uuid::Uuid::parse_str(value.trim())
        .map(|uuid| OwnerId::new(uuid.to_string()))
        .map_err(|error| format!("owner must be a UUID: {error}"))
}

/// Runs one command inside a session for `--owner`.
pub async fn run<W: Write>(
    cli: LinkshelfCli,
    controller: &SessionController,
    out: &mut W,
) -> Result<()> {
    let owner = cli.owner.context("--owner is required")?;
    controller
        .start(owner.clone())
        .await
        .with_context(|| format!("failed to start session for {owner}"))?;

    let result = match cli.command {
        Commands::List => write_records(out, &controller.snapshot()),
        Commands::Add { title, url } => add(controller, out, &title, &url).await,
        Commands::Delete { id } => delete(controller, out, RecordId(id)).await,
        Commands::Watch => watch(controller, out).await,
    };
    controller.end().await;
    result
}

async fn add<W: Write>(
    controller: &SessionController,
    out: &mut W,
    title: &str,
    url: &str,
) -> Result<()> {
    let draft = Draft::new(title, url)?;
    let outcome = controller.insert(&draft).await?;
    let status = match outcome {
        InsertOutcome::Inserted(_) => "inserted",
        InsertOutcome::AlreadyPresent(_) => "already_present",
        InsertOutcome::AlreadyDeleted(_) => "already_deleted",
    };
    write_line(out, &json!({ "status": status, "record": outcome.record() }))
}

async fn delete<W: Write>(
    controller: &SessionController,
    out: &mut W,
    id: RecordId,
) -> Result<()> {
    let status = match controller.delete(id).await? {
        DeleteOutcome::Removed => "removed",
        DeleteOutcome::AlreadyAbsent => "already_absent",
    };
    write_line(out, &json!({ "status": status, "id": id }))
}

async fn watch<W: Write>(controller: &SessionController, out: &mut W) -> Result<()> {
    let mut snapshots = controller.watch();
    write_line(out, &snapshot_json(&snapshots.borrow_and_update()))?;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("interrupted; ending session");
                return Ok(());
            }
            changed = snapshots.changed() => {
                changed.context("mirror dropped")?;
                let snapshot = snapshots.borrow_and_update().clone();
                write_line(out, &snapshot_json(&snapshot))?;
            }
        }
    }
}

fn write_records<W: Write>(out: &mut W, snapshot: &MirrorSnapshot) -> Result<()> {
    for record in snapshot.records.iter() {
        write_line(out, &serde_json::to_value(record)?)?;
    }
    Ok(())
}

fn snapshot_json(snapshot: &MirrorSnapshot) -> Value {
    json!({
        "owner": snapshot.owner,
        "busy": snapshot.busy,
        "records": snapshot.records.as_ref(),
    })
}

fn write_line<W: Write>(out: &mut W, value: &Value) -> Result<()> {
    writeln!(out, "{value}")?;
    out.flush()?;
    Ok(())
}
