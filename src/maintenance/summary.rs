//! Category summaries: the nightly general rewrite and the weekly
//! persistent addendum.

use tracing::{debug, info, warn};

use super::{MaintenanceEngine, NightlyReport, WeeklyReport};
use crate::ai::complete_text;
use crate::error::MnemosError;
use crate::prompts;
use crate::util::{fingerprint, truncate_chars};

/// Per-item cap inside summary prompts.
const ITEM_PROMPT_CHARS: usize = 500;

/// Rewrite each category's general summary from its active items. A category
/// whose items hash to the stored fingerprint is left alone; one with no
/// active items left gets an empty summary.
pub(super) fn general_summaries(
    engine: &MaintenanceEngine,
    user_id: &str,
    now: i64,
    report: &mut NightlyReport,
) -> Result<(), MnemosError> {
    let Some(llm) = engine.llm.as_deref() else {
        debug!(user_id, "no llm configured, skipping general summaries");
        return Ok(());
    };
    let store = &engine.store;

    for category in store.list_categories(user_id)? {
        let items = store.active_items(user_id, Some(&category.name))?;
        let fp = fingerprint(items.iter().map(|i| (i.id.as_str(), i.content.as_str())));
        if category.general_fingerprint.as_deref() == Some(fp.as_str()) {
            report.unchanged += 1;
            continue;
        }

        let summary = if items.is_empty() {
            String::new()
        } else {
            let lines: Vec<String> = items.iter().map(|i| truncate_chars(&i.content, ITEM_PROMPT_CHARS)).collect();
            match complete_text(llm, &prompts::general_summary(&category.name, &lines), user_id, "summarize") {
                Ok(s) => s,
                Err(e) => {
                    warn!(user_id, category = %category.name, error = %e, "general summary failed");
                    report.failed += 1;
                    continue;
                }
            }
        };
        store.set_general_summary(user_id, &category.name, &summary, &fp, now)?;
        report.summarized += 1;
        debug!(user_id, category = %category.name, items = items.len(), "general summary rebuilt");
    }
    Ok(())
}

/// Fold items older than the recency cutoff and newer than the category's
/// watermark into its persistent summary.
pub(super) fn persistent_summaries(
    engine: &MaintenanceEngine,
    user_id: &str,
    now: i64,
    report: &mut WeeklyReport,
) -> Result<(), MnemosError> {
    let Some(llm) = engine.llm.as_deref() else {
        debug!(user_id, "no llm configured, skipping persistent summaries");
        return Ok(());
    };
    let store = &engine.store;
    let cutoff = now - engine.config.persistent_recency_ms;

    for category in store.list_categories(user_id)? {
        let watermark = category.persistent_watermark;
        if watermark >= cutoff {
            continue;
        }
        let items = store.items_created_between(user_id, &category.name, watermark, cutoff)?;
        let Some(newest) = items.iter().map(|i| i.created_at).max() else {
            continue;
        };

        let lines: Vec<String> = items.iter().map(|i| truncate_chars(&i.content, ITEM_PROMPT_CHARS)).collect();
        let prompt = prompts::persistent_addendum(&category.name, &category.persistent_summary, &lines);
        let addendum = match complete_text(llm, &prompt, user_id, "persist") {
            Ok(a) => a,
            Err(e) => {
                warn!(user_id, category = %category.name, error = %e, "persistent addendum failed");
                report.failed += 1;
                continue;
            }
        };

        if store.append_persistent_summary(user_id, &category.name, &addendum, watermark, newest, now)? {
            report.persisted += 1;
            report.folded += items.len();
        } else {
            warn!(user_id, category = %category.name, "persistent watermark moved, skipping");
            report.skipped += 1;
        }
    }
    if report.persisted > 0 {
        info!(user_id, categories = report.persisted, items = report.folded, "persistent summaries extended");
    }
    Ok(())
}
