//! Fixed text used when rewriting context.

/// Appended wherever a block was cut to fit its budget.
pub const TRUNCATION_MARKER: &str = "\n\n[... truncated to fit context budget]";

/// Leads the synthetic message that replaces summarized history.
pub const SUMMARY_PREFIX: &str = "[Summary of earlier conversation]\n\n";

/// System prompt for the summarization call.
pub const SUMMARIZER_SYSTEM_PROMPT: &str = "You condense conversation transcripts. \
Write a compact summary of the transcript that preserves decisions, stated preferences, \
open questions, and concrete facts (names, numbers, file paths). Do not add commentary. \
Respond with the summary only.";

/// Heading of the canon lessons block.
pub const LESSONS_HEADING: &str = "## Critical Lessons";

/// Heading of the canon rules block.
pub const RULES_HEADING: &str = "## Absolute Rules";

/// Heading of the working memory block.
pub const WORKING_MEMORY_HEADING: &str = "## Working Memory";

/// Heading of the retrieved facts block.
pub const RETRIEVED_HEADING: &str = "## Relevant Memories";
