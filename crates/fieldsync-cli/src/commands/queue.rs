use std::path::Path;

use fieldsync_core::models::{EntityType, OperationKind, OperationStatus, Payload};
use fieldsync_core::store::AppendOutcome;
use fieldsync_core::sync::{EnqueueRequest, MutationQueue, RetryManager};

use crate::cli::QueueCommands;
use crate::commands::common::{
    format_operation_lines, open_store, operation_to_item, parse_fields, parse_operation_id,
    OperationListItem, ResolvedProfile,
};
use crate::error::CliError;

pub async fn run_queue(
    command: QueueCommands,
    db_path: &Path,
    profile: &ResolvedProfile,
) -> Result<(), CliError> {
    let queue = MutationQueue::new(
        open_store(db_path)?,
        RetryManager::new(profile.profile.sync.retry.clone()),
    );

    match command {
        QueueCommands::List { dead, json } => run_queue_list(&queue, dead, json).await,
        QueueCommands::Add {
            entity_type,
            entity_id,
            kind,
            fields,
            priority,
        } => {
            let outcome = queue_add(
                &queue,
                entity_type,
                &entity_id,
                kind,
                fields.as_deref(),
                priority,
            )
            .await?;
            match outcome {
                AppendOutcome::Appended(id) => println!("{id}"),
                AppendOutcome::Duplicate(id) => println!("{id} (identical operation already queued)"),
            }
            Ok(())
        }
        QueueCommands::Retry { id } => {
            let operation = queue.retry_dead(&parse_operation_id(&id)?).await?;
            println!("Requeued {} for {}:{}", operation.id, operation.entity_type, operation.entity_id);
            Ok(())
        }
        QueueCommands::Discard { id } => {
            let operation = queue.discard(&parse_operation_id(&id)?).await?;
            println!("Discarded {}", operation.id);
            Ok(())
        }
    }
}

async fn run_queue_list(queue: &MutationQueue, dead: bool, as_json: bool) -> Result<(), CliError> {
    let operations = if dead {
        queue.list_dead().await?
    } else {
        queue
            .list()
            .await?
            .into_iter()
            .filter(|operation| operation.status != OperationStatus::Dead)
            .collect()
    };

    if as_json {
        let json_items = operations
            .iter()
            .map(operation_to_item)
            .collect::<Vec<OperationListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!(
            "{}",
            if dead {
                "No dead operations."
            } else {
                "Queue is empty."
            }
        );
        return Ok(());
    }

    for line in format_operation_lines(&operations) {
        println!("{line}");
    }
    Ok(())
}

pub async fn queue_add(
    queue: &MutationQueue,
    entity_type: EntityType,
    entity_id: &str,
    kind: OperationKind,
    fields: Option<&str>,
    priority: i32,
) -> Result<AppendOutcome, CliError> {
    let entity_id = entity_id.trim();
    if entity_id.is_empty() {
        return Err(CliError::InvalidId(entity_id.to_string()));
    }

    let fields = parse_fields(fields)?;
    let payload = Payload::from_parts(entity_type, kind, &fields)?;
    let request = EnqueueRequest::new(entity_type, entity_id, payload).with_priority(priority);
    Ok(queue.enqueue(request).await?)
}
