use std::path::Path;

use fieldsync_core::models::Resolution;
use fieldsync_core::sync::ConflictResolver;
use fieldsync_core::LocalStore;

use crate::cli::{ConflictCommands, ResolutionChoice};
use crate::commands::common::{
    conflict_to_item, format_conflict_lines, open_store, parse_conflict_id, parse_fields,
    ConflictListItem, ResolvedProfile,
};
use crate::error::CliError;

impl From<ResolutionChoice> for Resolution {
    fn from(choice: ResolutionChoice) -> Self {
        match choice {
            ResolutionChoice::Local => Self::LocalWins,
            ResolutionChoice::Server => Self::ServerWins,
            ResolutionChoice::Merged => Self::Merged,
        }
    }
}

pub async fn run_conflicts(
    command: ConflictCommands,
    db_path: &Path,
    profile: &ResolvedProfile,
) -> Result<(), CliError> {
    let store = open_store(db_path)?;

    match command {
        ConflictCommands::List { all, json } => {
            let conflicts = store.list_conflicts(!all).await?;

            if json {
                let json_items = conflicts
                    .iter()
                    .map(conflict_to_item)
                    .collect::<Vec<ConflictListItem>>();
                println!("{}", serde_json::to_string_pretty(&json_items)?);
                return Ok(());
            }

            if conflicts.is_empty() {
                println!("No unresolved conflicts.");
                return Ok(());
            }
            for line in format_conflict_lines(&conflicts) {
                println!("{line}");
            }
            Ok(())
        }
        ConflictCommands::Resolve {
            id,
            strategy,
            fields,
        } => {
            let resolution = Resolution::from(strategy);
            let merged_fields = match resolution {
                Resolution::Merged => Some(parse_fields(fields.as_deref())?),
                Resolution::LocalWins | Resolution::ServerWins => None,
            };

            let resolver = ConflictResolver::new(store, profile.profile.sync.auto_merge_disjoint);
            let record = resolver
                .resolve(&parse_conflict_id(&id)?, resolution, merged_fields)
                .await?;
            println!(
                "Resolved {} ({}:{}) as {}",
                record.id, record.entity_type, record.entity_id, resolution
            );
            Ok(())
        }
    }
}
