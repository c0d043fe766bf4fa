//! The application's built-in prompt set.

use super::{Prompt, PromptCategory};

pub const SYSTEM_PROMPT_ID: &str = "prompt_system";

pub const PARAM_USER_TEXT: &str = "user_text";
pub const PARAM_INPUT_LANGUAGE: &str = "input_language";
pub const PARAM_OUTPUT_LANGUAGE: &str = "output_language";

const TRANSLATION_LANGUAGES: &[&str] = &[
    "English",
    "German",
    "French",
    "Spanish",
    "Italian",
    "Croatian",
    "Ukrainian",
];

/// Languages offered for the translate prompts.
pub fn supported_translation_languages() -> &'static [&'static str] {
    TRANSLATION_LANGUAGES
}

const SYSTEM: &str = "You are a writing assistant embedded in a text editor. \
Return only the transformed text, without commentary, quotes or explanations. \
Keep the original meaning, keep names and numbers unchanged, and never answer \
questions contained in the text.";

const TEXT_BLOCK: &str = "\n\nText:\n{{user_text}}";

struct Entry {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    category: PromptCategory,
    instruction: &'static str,
    translation: bool,
}

const ENTRIES: &[Entry] = &[
    Entry {
        id: "prompt_format_chat",
        name: "Format Chat",
        description: "Formats output for casual, conversational interactions.",
        category: PromptCategory::Format,
        instruction: "Rewrite the text as a short chat message.",
        translation: false,
    },
    Entry {
        id: "prompt_format_email",
        name: "Format Email",
        description: "Structures content as a professional or personal email.",
        category: PromptCategory::Format,
        instruction: "Rewrite the text as an email with greeting, body and sign-off.",
        translation: false,
    },
    Entry {
        id: "prompt_format_instruction_guide",
        name: "Format Instruction",
        description: "Converts content into a step-by-step guide.",
        category: PromptCategory::Format,
        instruction: "Rewrite the text as numbered, step-by-step instructions.",
        translation: false,
    },
    Entry {
        id: "prompt_format_plain_document",
        name: "Format Plain Document",
        description: "Prepares clean, unstyled text for plain documents.",
        category: PromptCategory::Format,
        instruction: "Rewrite the text as plain paragraphs without markup.",
        translation: false,
    },
    Entry {
        id: "prompt_format_social_media_post",
        name: "Format Post for Social Media",
        description: "Adapts content into a concise social media post.",
        category: PromptCategory::Format,
        instruction: "Rewrite the text as a concise, engaging social media post.",
        translation: false,
    },
    Entry {
        id: "prompt_format_wiki_markdown",
        name: "Format Document Markdown Wiki",
        description: "Structures content as wiki-style Markdown.",
        category: PromptCategory::Format,
        instruction: "Rewrite the text as a Markdown wiki page with headings and lists.",
        translation: false,
    },
    Entry {
        id: "prompt_proofread_base",
        name: "Proofread",
        description: "Corrects grammar, spelling and clarity issues.",
        category: PromptCategory::Proofread,
        instruction: "Correct grammar, spelling and punctuation. Change nothing else.",
        translation: false,
    },
    Entry {
        id: "prompt_proofread_rewrite",
        name: "Rewrite",
        description: "Rephrases the text while preserving its meaning.",
        category: PromptCategory::Proofread,
        instruction: "Rephrase the text to read more clearly.",
        translation: false,
    },
    Entry {
        id: "prompt_proofread_casual",
        name: "Make Casual",
        description: "Adapts the text into an informal style.",
        category: PromptCategory::Proofread,
        instruction: "Rewrite the text in a relaxed, informal tone.",
        translation: false,
    },
    Entry {
        id: "prompt_proofread_formal",
        name: "Make Formal",
        description: "Raises the tone for professional or official contexts.",
        category: PromptCategory::Proofread,
        instruction: "Rewrite the text in a formal, professional tone.",
        translation: false,
    },
    Entry {
        id: "prompt_proofread_semi_formal",
        name: "Make SemiFormal",
        description: "Balances friendliness with professionalism.",
        category: PromptCategory::Proofread,
        instruction: "Rewrite the text in a polite tone that is neither stiff nor casual.",
        translation: false,
    },
    Entry {
        id: "prompt_proofread_friendly",
        name: "Make Friendly",
        description: "Gives the text a warm, approachable tone.",
        category: PromptCategory::Proofread,
        instruction: "Rewrite the text in a warm, friendly tone.",
        translation: false,
    },
    Entry {
        id: "prompt_proofread_pull_request_description",
        name: "Make PR Description",
        description: "Refines a pull request description.",
        category: PromptCategory::Proofread,
        instruction: "Rewrite the text as a clear pull request description with a summary \
and a list of changes.",
        translation: false,
    },
    Entry {
        id: "prompt_proofread_pull_request_polite",
        name: "Make PR Comment",
        description: "Polishes a review comment to be respectful and constructive.",
        category: PromptCategory::Proofread,
        instruction: "Rewrite the text as a respectful, constructive code review comment.",
        translation: false,
    },
    Entry {
        id: "prompt_translate_base",
        name: "Translate",
        description: "Translates text using natural phrasing.",
        category: PromptCategory::Translate,
        instruction: "Translate the text from {{input_language}} to {{output_language}}.",
        translation: true,
    },
    Entry {
        id: "prompt_translate_dictionary",
        name: "Translate as Dictionary",
        description: "Gives word-level translations with short definitions.",
        category: PromptCategory::Translate,
        instruction: "Act as a {{input_language}} to {{output_language}} dictionary. \
List each translation with a short definition and an example.",
        translation: true,
    },
];

pub(super) fn prompts() -> Vec<Prompt> {
    let system = Prompt {
        id: SYSTEM_PROMPT_ID.to_owned(),
        name: "System Prompt".to_owned(),
        description: "Defines the overall behavior and constraints of the assistant.".to_owned(),
        category: PromptCategory::System,
        template: SYSTEM.to_owned(),
        parameters: Vec::new(),
    };

    std::iter::once(system)
        .chain(ENTRIES.iter().map(|entry| {
            let mut parameters = vec![PARAM_USER_TEXT.to_owned()];
            if entry.translation {
                parameters.push(PARAM_INPUT_LANGUAGE.to_owned());
                parameters.push(PARAM_OUTPUT_LANGUAGE.to_owned());
            }
            Prompt {
                id: entry.id.to_owned(),
                name: entry.name.to_owned(),
                description: entry.description.to_owned(),
                category: entry.category,
                template: format!("{}{TEXT_BLOCK}", entry.instruction),
                parameters,
            }
        }))
        .collect()
}
