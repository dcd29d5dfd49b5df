//! Tree-walk producer: turns a remote folder tree into transfer tasks.

use std::collections::VecDeque;

use tracing::{debug, info, instrument};

use super::{RemoteEntry, RemoteStorage, StorageError};
use crate::browser::ProfileKind;
use crate::queue::TransferTask;
use crate::retry::{RetryError, RetryPolicy, with_retry};

/// Walks the tree under `root_id` breadth-first and returns one task per
/// supported file.
///
/// Every source folder is mirrored under `destination_id` (reusing an
/// existing same-named folder), and each task's destination is the mirrored
/// parent. Files whose MIME type no profile can discover are skipped.
///
/// Each listing and folder creation runs under `policy`.
///
/// # Errors
///
/// Returns the first [`StorageError`] that `policy` gives up on.
#[instrument(skip(storage, policy))]
pub async fn discover_tasks(
    storage: &dyn RemoteStorage,
    policy: &RetryPolicy,
    root_id: &str,
    destination_id: &str,
) -> Result<Vec<TransferTask>, StorageError> {
    let mut tasks = Vec::new();
    let mut folders = VecDeque::from([(root_id.to_string(), destination_id.to_string(), 0u32)]);

    while let Some((source_folder, dest_folder, depth)) = folders.pop_front() {
        let children = list_children(storage, policy, &source_folder).await?;
        let mut existing: Option<Vec<_>> = None;

        for entry in children {
            if entry.is_folder {
                if existing.is_none() {
                    existing = Some(list_children(storage, policy, &dest_folder).await?);
                }
                let mirrored = match existing
                    .as_ref()
                    .and_then(|list| list.iter().find(|e| e.is_folder && e.name == entry.name))
                {
                    Some(found) => found.id.clone(),
                    None => {
                        let (parent, name) = (dest_folder.as_str(), entry.name.as_str());
                        with_retry(policy, "create folder", |_| storage.create_folder(parent, name))
                            .await
                            .map_err(RetryError::into_inner)?
                            .id
                    }
                };
                debug!(folder = %entry.name, depth = depth + 1, "descending");
                folders.push_back((entry.id, mirrored, depth + 1));
                continue;
            }

            let Some(kind) = ProfileKind::from_mime(&entry.mime_type) else {
                debug!(name = %entry.name, mime = %entry.mime_type, "unsupported type, skipping");
                continue;
            };
            let source_ref = entry.web_url.unwrap_or_else(|| entry.id.clone());
            tasks.push(
                TransferTask::new(source_ref, entry.name, dest_folder.clone(), kind)
                    .with_id(entry.id)
                    .with_depth(depth),
            );
        }
    }

    info!(tasks = tasks.len(), "tree walk complete");
    Ok(tasks)
}

async fn list_children(
    storage: &dyn RemoteStorage,
    policy: &RetryPolicy,
    folder_id: &str,
) -> Result<Vec<RemoteEntry>, StorageError> {
    with_retry(policy, "list children", |_| storage.list_children(folder_id))
        .await
        .map_err(RetryError::into_inner)
}
