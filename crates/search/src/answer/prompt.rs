//! Prompt construction and canned replies

use crate::retrieval::NoResultReason;
use scoperag_common::scope::SourceType;

/// Placeholder used when retrieval returned nothing
pub const NO_REFERENCE_MATERIAL: &str = "No reference material";

const COMMON_RULES: &str = "\
- Answer in at most 600 characters
- Use at most 5 bullet points
- Keep to the essentials";

/// User prompt combining the question with the retrieved context
pub fn build_prompt(source: SourceType, question: &str, context: &str) -> String {
    let context = if context.trim().is_empty() { NO_REFERENCE_MATERIAL } else { context };

    let (role, material, not_found, forbidden) = match source {
        SourceType::Mail => (
            "mail search assistant",
            "Reference mails",
            "No related mail was found.",
            "links, URLs, or email addresses",
        ),
        SourceType::Doc => (
            "document search assistant",
            "Reference documents",
            "No related document was found.",
            "links, URLs, or file paths",
        ),
    };

    format!(
        "You are a {role}. Answer concisely.\n\
         \n\
         Question: {question}\n\
         \n\
         {material}:\n\
         {context}\n\
         \n\
         Answer rules:\n\
         {COMMON_RULES}\n\
         - When {material_lower} are provided, base the answer on them only\n\
         - Only if the {material_lower} read \"{NO_REFERENCE_MATERIAL}\", reply \"{not_found}\"\n\
         - Never include {forbidden} in the answer",
        material_lower = material.to_lowercase(),
    )
}

/// Reply sent without calling the model when retrieval found nothing usable
pub fn no_results_message(source: SourceType, reason: NoResultReason) -> &'static str {
    match (reason, source) {
        (NoResultReason::BackendUnavailable, _) => {
            "The search service is unreachable right now. Please try again shortly."
        }
        (_, SourceType::Mail) => {
            "No related mail was found. Try rephrasing the question or adding a sender or subject."
        }
        (_, SourceType::Doc) => {
            "No related document was found. Try rephrasing the question or naming the document."
        }
    }
}

/// Text shown when another scope served the request
pub fn scope_fallback_notice(from: &str, to: &str) -> String {
    format!(
        "The {} search service was unreachable; results come from the {} store instead.",
        from, to
    )
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// True when the question contains one of `greetings` as whole words
pub fn is_greeting(question: &str, greetings: &[String]) -> bool {
    let question = words(question);
    greetings.iter().any(|greeting| {
        let greeting = words(greeting);
        !greeting.is_empty() && question.windows(greeting.len()).any(|w| w == greeting.as_slice())
    })
}
