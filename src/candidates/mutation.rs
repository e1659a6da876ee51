//! Prompt mutation generation for candidate diversity.
//!
//! One variant is always the pristine baseline; the rest get a systematic
//! textual variation so the candidate set explores the instruction space
//! instead of resampling the same prompt N times.

use std::sync::Arc;

use crate::cascade::MutationMode;
use crate::message::Message;
use crate::provider::{ChatClient, ChatRequest};

/// Built-in prefixes for `augment` mode.
const AUGMENT_PREFIXES: &[&str] = &[
    "Be extremely concise and direct. ",
    "Think step by step before answering. ",
    "Consider edge cases and failure modes first. ",
    "Favor concrete examples over abstractions. ",
    "Challenge your first instinct before committing. ",
    "Prioritize correctness over completeness. ",
];

/// Built-in suffixes for `approach` mode.
const APPROACH_PHRASES: &[&str] = &[
    "\n\nApproach: work backwards from the desired result.",
    "\n\nApproach: enumerate options first, then choose.",
    "\n\nApproach: draft quickly, then refine once.",
    "\n\nApproach: reason from first principles.",
    "\n\nApproach: imagine reviewing someone else's answer to this.",
    "\n\nApproach: start from the most constrained requirement.",
];

/// The textual variation applied to one candidate attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationRecord {
    /// Exact variation text, persisted as `mutation_applied`.
    pub applied: String,
    /// `rewrite`, `augment`, `approach`, or `custom`.
    pub mutation_type: String,
    /// Full mutated instructions.
    pub instructions: String,
}

/// Produce `count` mutations of the base instructions.
///
/// Custom mutations are consumed first; the remainder come from the
/// configured mode. `rewrite` asks the utility model for paraphrases and
/// falls back to `augment` prefixes when the model misbehaves.
pub async fn generate_mutations(
    mode: MutationMode,
    custom: &[String],
    base_instructions: &str,
    count: usize,
    chat: &Arc<dyn ChatClient>,
    utility_model: &str,
) -> Vec<MutationRecord> {
    let mut mutations: Vec<MutationRecord> = Vec::with_capacity(count);

    for custom_text in custom.iter().take(count) {
        mutations.push(MutationRecord {
            applied: custom_text.clone(),
            mutation_type: "custom".to_string(),
            instructions: format!("{custom_text}\n\n{base_instructions}"),
        });
    }
    if mutations.len() >= count {
        return mutations;
    }
    let remaining = count - mutations.len();

    match mode {
        MutationMode::Augment => {
            mutations.extend(prefix_mutations(base_instructions, remaining));
        }
        MutationMode::Approach => {
            for phrase in APPROACH_PHRASES.iter().cycle().take(remaining) {
                mutations.push(MutationRecord {
                    applied: phrase.trim().to_string(),
                    mutation_type: "approach".to_string(),
                    instructions: format!("{base_instructions}{phrase}"),
                });
            }
        }
        MutationMode::Rewrite => {
            let rewrites = rewrite_mutations(base_instructions, remaining, chat, utility_model)
                .await;
            if rewrites.len() < remaining {
                let missing = remaining - rewrites.len();
                mutations.extend(rewrites);
                mutations.extend(prefix_mutations(base_instructions, missing));
            } else {
                mutations.extend(rewrites);
            }
        }
    }

    mutations.truncate(count);
    mutations
}

fn prefix_mutations(base_instructions: &str, count: usize) -> Vec<MutationRecord> {
    AUGMENT_PREFIXES
        .iter()
        .cycle()
        .take(count)
        .map(|prefix| MutationRecord {
            applied: prefix.trim().to_string(),
            mutation_type: "augment".to_string(),
            instructions: format!("{prefix}{base_instructions}"),
        })
        .collect()
}

async fn rewrite_mutations(
    base_instructions: &str,
    count: usize,
    chat: &Arc<dyn ChatClient>,
    utility_model: &str,
) -> Vec<MutationRecord> {
    let prompt = format!(
        "Rewrite the following instructions {count} different ways. Preserve the intent \
         exactly; vary wording, emphasis, and approach. Reply with ONLY a JSON array of \
         {count} strings.\n\nInstructions:\n{base_instructions}"
    );
    let response = match chat
        .complete(ChatRequest::new(
            utility_model,
            vec![Message::user(prompt)],
        ))
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(target: "rvbbit::candidates", error = %err, "rewrite mutation call failed");
            return Vec::new();
        }
    };

    let rewrites: Vec<String> =
        serde_json::from_str(response.content.trim()).unwrap_or_default();
    rewrites
        .into_iter()
        .filter(|text| !text.trim().is_empty())
        .take(count)
        .map(|text| MutationRecord {
            applied: text.clone(),
            mutation_type: "rewrite".to_string(),
            instructions: text,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatResponse, ProviderError};
    use async_trait::async_trait;

    struct ArrayClient;

    #[async_trait]
    impl ChatClient for ArrayClient {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: r#"["variant one", "variant two"]"#.to_string(),
                ..ChatResponse::default()
            })
        }
    }

    #[tokio::test]
    async fn augment_cycles_prefixes() {
        let chat: Arc<dyn ChatClient> = Arc::new(ArrayClient);
        let mutations = generate_mutations(
            MutationMode::Augment,
            &[],
            "Write a poem",
            8,
            &chat,
            "utility",
        )
        .await;
        assert_eq!(mutations.len(), 8);
        assert!(mutations.iter().all(|m| m.mutation_type == "augment"));
        assert!(mutations[0].instructions.ends_with("Write a poem"));
    }

    #[tokio::test]
    async fn custom_mutations_come_first() {
        let chat: Arc<dyn ChatClient> = Arc::new(ArrayClient);
        let mutations = generate_mutations(
            MutationMode::Rewrite,
            &["Use pirate voice".to_string()],
            "Write a poem",
            2,
            &chat,
            "utility",
        )
        .await;
        assert_eq!(mutations.len(), 2);
        assert_eq!(mutations[0].mutation_type, "custom");
        assert_eq!(mutations[1].mutation_type, "rewrite");
        assert_eq!(mutations[1].instructions, "variant one");
    }
}
