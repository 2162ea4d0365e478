//! Centralised prompt texts.
//!
//! Every LLM prompt lives here so they can be audited and tuned in one
//! place. Builders fill in the variable parts; the rest of the crate imports
//! from `crate::prompts`.

// ---------------------------------------------------------------------------
// file memory — memorize
// ---------------------------------------------------------------------------

pub const EXTRACT_ITEMS: &str = r#"Extract discrete, atomic facts that are explicitly stated in the text below.
Look for preferences, habits, personal details, opinions, plans and decisions.
Every fact must make sense on its own, without the surrounding text.
Never infer or reinterpret; only extract what is said.

Text:
{text}

Return a JSON array of objects with keys "content" and "category_hint".
category_hint is a short lowercase label such as "work", "preferences", "health" or "goals".

Return ONLY valid JSON."#;

pub fn extract_items(text: &str) -> String {
    EXTRACT_ITEMS.replace("{text}", text)
}

pub const CLASSIFY_ITEMS: &str = r#"Assign each memory item to one of the existing categories, or propose a new short category name when none fits.

Preferred names: work, preferences, personal, health, schedule, behavior, goals, travel, tech, relationships.

Existing categories:
{categories}

Items:
{items}

Return a JSON array of objects with keys "content" and "category", one per item, in the same order.
Category names are lowercase, short and descriptive.
Times, dates and routines go to "schedule"; habits go to "behavior"; plans go to "goals".

Return ONLY valid JSON."#;

pub fn classify_items(categories: &[String], items: &[String]) -> String {
    CLASSIFY_ITEMS
        .replace("{categories}", &bullet_list(categories, "(none yet)"))
        .replace("{items}", &bullet_list(items, "(none)"))
}

// ---------------------------------------------------------------------------
// file memory — retrieve (auto level)
// ---------------------------------------------------------------------------

pub const SELECT_CATEGORIES: &str = r#"Pick the memory categories most likely to hold information relevant to the query.

Query: {query}

Categories:
{categories}

Return a JSON array of category names. When unsure, include more rather than fewer.

Return ONLY valid JSON."#;

pub fn select_categories(query: &str, categories: &[String]) -> String {
    SELECT_CATEGORIES
        .replace("{query}", query)
        .replace("{categories}", &bullet_list(categories, "(none)"))
}

pub const SUFFICIENCY_CHECK: &str = r#"Do the summaries below contain enough information to fully answer the query?

Query: {query}

Summaries:
{summaries}

Answer with exactly YES or NO."#;

pub fn sufficiency_check(query: &str, summaries: &str) -> String {
    SUFFICIENCY_CHECK
        .replace("{query}", query)
        .replace("{summaries}", summaries)
}

// ---------------------------------------------------------------------------
// graph memory
// ---------------------------------------------------------------------------

pub const EXTRACT_TRIPLETS: &str = r#"Extract knowledge-graph triplets (subject, predicate, object) explicitly stated in the text.
Keep subjects and objects short and entity-like: names, roles, organizations, places, concrete attributes.
Split statements with several relations into several triplets. Skip narrative or purely subjective statements.
Refer to the speaker as "User".

Text:
{text}

Return a JSON array of objects with keys "subject", "predicate", "object" and "status".
status is "current" for present facts, "past" for former ones ("I used to work at X") and "uncertain" when unclear.

Return ONLY valid JSON."#;

pub fn extract_triplets(text: &str) -> String {
    EXTRACT_TRIPLETS.replace("{text}", text)
}

pub const EXTRACT_ENTITIES: &str = r#"List the entities (people, organizations, places, things) the query is about.
Refer to the speaker as "User".

Query: {query}

Return a JSON array of entity strings.

Return ONLY valid JSON."#;

pub fn extract_entities(query: &str) -> String {
    EXTRACT_ENTITIES.replace("{query}", query)
}

// ---------------------------------------------------------------------------
// maintenance
// ---------------------------------------------------------------------------

pub const COMPRESS_ITEMS: &str = r#"These memory items say nearly the same thing. Merge them into ONE concise item.
Keep every concrete detail from every item: names, numbers, times, dates, step order, fallback plans.
Write in the same language as the items.

Items:
{items}

Output ONLY the merged item text."#;

pub fn compress_items(items: &[String]) -> String {
    COMPRESS_ITEMS.replace("{items}", &bullet_list(items, "(none)"))
}

pub const GENERAL_SUMMARY: &str = r#"Write the current summary of the "{category}" memory category from its active items.
Resolve contradictions in favour of the newer item (items are listed oldest first).
Keep exact times, dates, durations and step order. Drop redundancy.

Items:
{items}

Output ONLY the markdown summary."#;

pub fn general_summary(category: &str, items: &[String]) -> String {
    GENERAL_SUMMARY
        .replace("{category}", category)
        .replace("{items}", &bullet_list(items, "(none)"))
}

pub const PERSISTENT_ADDENDUM: &str = r#"You maintain the long-term record of the "{category}" memory category.

Existing long-term record:
{existing}

Older items not yet reflected in it:
{items}

Write a short markdown addendum covering only what the existing record does not already say.
Output ONLY the addendum."#;

pub fn persistent_addendum(category: &str, existing: &str, items: &[String]) -> String {
    let existing = if existing.trim().is_empty() { "(empty)" } else { existing };
    PERSISTENT_ADDENDUM
        .replace("{category}", category)
        .replace("{existing}", existing)
        .replace("{items}", &bullet_list(items, "(none)"))
}

// ---------------------------------------------------------------------------
// recall — search query rewrite
// ---------------------------------------------------------------------------

pub const SEARCH_QUERY: &str = r#"Rewrite this user message as a short search query for finding relevant memories.
Keep the key concepts, entities and intent.

User message: {message}

Return ONLY the search query, without quotes or explanation."#;

pub fn search_query(message: &str) -> String {
    SEARCH_QUERY.replace("{message}", message)
}

// ---------------------------------------------------------------------------
// tool-use instructions for agent runtimes (tool mode)
// ---------------------------------------------------------------------------

pub const FILE_MEMORY_TOOL_INSTRUCTIONS: &str = r#"File memory

Purpose: keep narrative facts about the user (preferences, habits, schedules, goals, personal details).

Tools:
1) memorize (write)
   Use for new facts, corrections and updates.
   Inputs:
   - text: the user's original words
   - items: list of {content, category}; category defaults to "general"
   Returns the ids of the stored items.

2) retrieve (read)
   Use to answer questions about preferences, schedules and personal details.
   Inputs:
   - query: the user's question
   - level: "summaries" | "items" | "resources" | "auto", optionally suffixed "_then_semantic";
     "semantic" (alias "vector_only") for pure similarity search; "_then_vector" is accepted for "_then_semantic"
   - categories: restrict to these categories (optional)
   - search_query: keywords overriding the ones derived from query (optional)
   Returns a markdown block of summaries, items, raw text and semantic matches.

Guidance:
- Keep items atomic and explicit, one fact each.
- Prefer these categories when they fit: work, preferences, personal, health, schedule, behavior, goals, travel, tech, relationships.
- Keep search_query short and keyword-like (2-8 terms), not a sentence.
- If keyword retrieval misses, retry with "semantic" or a "*_then_semantic" level.
- Summaries are written by maintenance; both the general and the persistent summary are returned when present.
- "auto" never escalates past summaries in tool mode."#;

pub const GRAPH_MEMORY_TOOL_INSTRUCTIONS: &str = r#"Graph memory

Purpose: keep relational facts as subject-predicate-object triplets.

Triplet: {subject, predicate, object, status}, status = "current" | "past" | "uncertain".
Any other status is stored as "uncertain".

Tools:
1) memorize (write)
   Use for stable relations (works_at, manages, owns, located_in, ...).
   Inputs:
   - text: the user's original words
   - triplets: list of {subject, predicate, object, status}
   A new current triplet turns the previous current one with the same subject and predicate into "past".
   Writing the same current triplet again changes nothing.

2) retrieve (read)
   Use for relationship and identity questions.
   Inputs:
   - query: the user's question
   - entities: entity names to start from (recommended in tool mode; query keywords are used otherwise)
   - level: "graph_only" | "graph_then_vector" | "vector_only"
   - expand: "none" | "low" | "medium" | "high" | "full"
   Returns facts labelled with their status, plus related passages when the graph is sparse.

Guidance:
- Use clean entity names for subject and object (people, organisations, places, roles).
- Split long narrative objects into several triplets.
- Record history with status "past" instead of deleting anything.
- Current facts are listed before uncertain ones, and those before past ones.
- expand: "none" = the entity's own current facts; "low" = one hop, current only;
  "medium" (default) = one hop, current and uncertain; "high" = two hops, current and uncertain;
  "full" = three hops, every status including past."#;

// ---------------------------------------------------------------------------
// ai.rs — JSON re-ask
// ---------------------------------------------------------------------------

pub fn json_retry(prompt: &str, bad_output: &str, error: &str) -> String {
    format!(
        "{prompt}\n\nYour previous answer was not valid JSON ({error}):\n{bad_output}\n\nReply again with ONLY valid JSON."
    )
}

fn bullet_list(lines: &[String], empty: &str) -> String {
    if lines.is_empty() {
        return empty.to_string();
    }
    lines
        .iter()
        .map(|l| format!("- {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}
