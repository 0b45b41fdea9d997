use std::path::PathBuf;

use anyhow::Context;
use inbox_core::{load_app_config, InboxDb, DB_FILE_NAME};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let data_dir: PathBuf = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: inbox_dump <data_dir> [--provider-id ID]"))?
        .into();

    let mut provider_id: Option<String> = None;
    while let Some(a) = args.next() {
        if a == "--provider-id" {
            let id = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("--provider-id requires a value"))?;
            provider_id = Some(id);
            continue;
        }
        return Err(anyhow::anyhow!("unknown arg: {a}"));
    }

    let config = load_app_config(&data_dir);
    tracing::info!(
        data_dir = %data_dir.display(),
        backend_url = config.backend_url().as_deref().unwrap_or("-"),
        "opening inbox database"
    );

    let db_path = data_dir.join(DB_FILE_NAME);
    if !db_path.exists() {
        anyhow::bail!("no inbox database at {}", db_path.display());
    }
    let db = InboxDb::open(&data_dir)
        .with_context(|| format!("open inbox database in {}", data_dir.display()))?;

    let inboxes = match provider_id {
        Some(id) => db.find_by_provider_id(&id)?.into_iter().collect(),
        None => db.load_all()?,
    };
    tracing::info!(count = inboxes.len(), "loaded inboxes");

    println!("{}", serde_json::to_string_pretty(&inboxes)?);
    Ok(())
}
