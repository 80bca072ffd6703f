use std::collections::HashSet;

use tracing::{debug, warn};

use crate::clients::ChangeSource;
use crate::error::SourceError;
use crate::models::{ChangeNotification, EntityKind, StreamCursor};

/// Fetch every change matching `cursor`, following offset pagination.
///
/// When the cursor carries a page size and a time window, pages are
/// re-requested while each page comes back full. A backfill window or a
/// listing that leaves records unprocessed advances the offset; a listing
/// that marks records processed always re-reads offset zero, and stops once
/// a page brings nothing new. Results are concatenated in request order.
/// Any page error aborts the whole fetch.
pub async fn fetch_changes(
    source: &dyn ChangeSource,
    entity: EntityKind,
    mut cursor: StreamCursor,
) -> Result<Vec<ChangeNotification>, SourceError> {
    let consuming = cursor.consumes_listing();
    let mut seen: HashSet<String> = HashSet::new();
    let mut results = Vec::new();
    let mut pages = 0usize;

    loop {
        let page = source.list_changed(entity, &cursor).await?;
        let page_len = page.len();
        pages += 1;

        let before = results.len();
        for record in page {
            if !consuming || seen.insert(record.entity_id.clone()) {
                results.push(record);
            }
        }

        match cursor.limit {
            Some(limit) if cursor.is_paginated() && page_len == limit as usize => {
                if !consuming {
                    cursor.offset += limit;
                } else if results.len() == before {
                    warn!(
                        stream = %entity,
                        pages,
                        "Source repeated an already listed page, stopping fetch"
                    );
                    break;
                }
            }
            _ => break,
        }
    }

    debug!(stream = %entity, pages, total = results.len(), "Change fetch complete");
    Ok(results)
}
