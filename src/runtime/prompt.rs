//! Translation prompt construction.
//!
//! A request becomes a single structured user message carrying the
//! language codes and the text, which is then rendered through the model's
//! Jinja chat template with minijinja. Targets the model tends to collapse
//! into another variant also get an explicit instruction prepended to the
//! text; the structured code is passed through unchanged, so both channels
//! always reach the model.

use minijinja::{context, Environment, ErrorKind};
use serde::Serialize;
use tracing::{debug, warn};

use crate::api::translation::{TranslationRequest, TEXT_CONTENT_TYPE};
use crate::error::{Error, Result};

/// A language offered to clients
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Language {
    pub code: &'static str,
    pub name: &'static str,
}

pub const LANGUAGES: &[Language] = &[
    Language { code: "en", name: "English" },
    Language { code: "zh", name: "Chinese (Simplified)" },
    Language { code: "zh-TW", name: "Chinese (Traditional)" },
    Language { code: "es", name: "Spanish" },
    Language { code: "fr", name: "French" },
    Language { code: "de", name: "German" },
    Language { code: "ja", name: "Japanese" },
    Language { code: "ko", name: "Korean" },
    Language { code: "ru", name: "Russian" },
    Language { code: "it", name: "Italian" },
    Language { code: "pt", name: "Portuguese" },
    Language { code: "ar", name: "Arabic" },
    Language { code: "hi", name: "Hindi" },
    Language { code: "vi", name: "Vietnamese" },
    Language { code: "th", name: "Thai" },
];

/// Display name for a language code (case-insensitive)
pub fn language_name(code: &str) -> Option<&'static str> {
    LANGUAGES
        .iter()
        .find(|language| language.code.eq_ignore_ascii_case(code))
        .map(|language| language.name)
}

struct LanguageHint {
    codes: &'static [&'static str],
    instruction: &'static str,
}

// Gemma maps "zh-TW" onto Simplified output unless told otherwise.
const LANGUAGE_HINTS: &[LanguageHint] = &[LanguageHint {
    codes: &["zh-TW", "zh-Hant", "zh-HK"],
    instruction: "Translate the following text into Traditional Chinese (繁體中文):",
}];

/// Instruction prepended to the content for ambiguous target codes
pub fn disambiguation_hint(target_lang: &str) -> Option<&'static str> {
    LANGUAGE_HINTS
        .iter()
        .find(|hint| hint.codes.iter().any(|code| code.eq_ignore_ascii_case(target_lang)))
        .map(|hint| hint.instruction)
}

/// One structured content item of a translation turn
#[derive(Debug, Clone, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub source_lang_code: String,
    pub target_lang_code: String,
    pub text: String,
}

/// Chat message structure for template rendering
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: Vec<ContentPart>,
}

/// Build the user turn for a request, applying the target-language hint.
pub fn translation_message(request: &TranslationRequest) -> Result<ChatMessage> {
    if request.content_type != TEXT_CONTENT_TYPE {
        return Err(Error::UnsupportedContentType(request.content_type.clone()));
    }
    let content = request.text_content();
    let text = match disambiguation_hint(&request.target_lang) {
        Some(instruction) => format!("{}\n{}", instruction, content),
        None => content.to_string(),
    };

    Ok(ChatMessage {
        role: "user",
        content: vec![ContentPart {
            kind: TEXT_CONTENT_TYPE,
            source_lang_code: request.source_lang.clone(),
            target_lang_code: request.target_lang.clone(),
            text,
        }],
    })
}

/// Fallback Gemma turn template used when the model ships none, or when
/// its own template cannot be rendered.
const BUILTIN_TEMPLATE: &str = "{{ bos_token }}<start_of_turn>user\
{% for message in messages %}{% for part in message.content %}
You are a professional {{ language_name(part.source_lang_code) }} ({{ part.source_lang_code }}) to \
{{ language_name(part.target_lang_code) }} ({{ part.target_lang_code }}) translator. \
Produce only the {{ language_name(part.target_lang_code) }} translation, without any additional \
explanations or commentary. Please translate the following {{ language_name(part.source_lang_code) }} \
text into {{ language_name(part.target_lang_code) }}:


{{ part.text }}{% endfor %}{% endfor %}<end_of_turn>
{% if add_generation_prompt %}<start_of_turn>model
{% endif %}";

const DEFAULT_BOS_TOKEN: &str = "<bos>";
const DEFAULT_EOS_TOKEN: &str = "<eos>";

/// Renders translation requests into model-ready prompt strings
pub struct PromptBuilder {
    env: Environment<'static>,
    chat_template: Option<String>,
    bos_token: String,
    eos_token: String,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

impl PromptBuilder {
    /// Create a builder; `chat_template` is the Jinja source from the
    /// model's `tokenizer_config.json`, if any.
    pub fn new(
        chat_template: Option<String>,
        bos_token: Option<String>,
        eos_token: Option<String>,
    ) -> Self {
        let mut env = Environment::new();

        env.add_function("language_name", |code: String| -> String {
            language_name(&code).map(str::to_string).unwrap_or(code)
        });
        env.add_function("raise_exception", |message: String| -> std::result::Result<String, minijinja::Error> {
            Err(minijinja::Error::new(ErrorKind::InvalidOperation, message))
        });
        env.add_test("startswith", |value: &str, prefix: &str| -> bool {
            value.starts_with(prefix)
        });
        env.add_test("endswith", |value: &str, suffix: &str| -> bool {
            value.ends_with(suffix)
        });

        Self {
            env,
            chat_template,
            bos_token: bos_token.unwrap_or_else(|| DEFAULT_BOS_TOKEN.to_string()),
            eos_token: eos_token.unwrap_or_else(|| DEFAULT_EOS_TOKEN.to_string()),
        }
    }

    pub fn has_model_template(&self) -> bool {
        self.chat_template.is_some()
    }

    /// Build the prompt for a request. Fails before rendering when the
    /// content type is unsupported.
    pub fn build(&self, request: &TranslationRequest) -> Result<String> {
        let message = translation_message(request)?;
        let messages = [message];

        if let Some(template) = &self.chat_template {
            match self.render(template, &messages) {
                Ok(prompt) => return Ok(prompt),
                Err(e) => warn!("Model chat template failed to render, using built-in template: {}", e),
            }
        }
        self.render(BUILTIN_TEMPLATE, &messages)
    }

    fn render(&self, template: &str, messages: &[ChatMessage]) -> Result<String> {
        // HuggingFace templates use Python string methods minijinja lacks
        let template = if template.contains(".startswith(") || template.contains(".endswith(") {
            template
                .replace(".startswith(", " is startswith(")
                .replace(".endswith(", " is endswith(")
        } else {
            template.to_string()
        };

        let prompt = self.env.render_str(
            &template,
            context! {
                messages => messages,
                bos_token => &self.bos_token,
                eos_token => &self.eos_token,
                add_generation_prompt => true,
            },
        )?;
        debug!("Rendered prompt ({} chars)", prompt.len());
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traditional_chinese_gets_both_channels() {
        let request = TranslationRequest::text("en", "zh-TW", "Hello");
        let prompt = PromptBuilder::default().build(&request).unwrap();

        assert!(prompt.contains("(zh-TW)"));
        assert!(prompt.contains("Translate the following text into Traditional Chinese (繁體中文):\nHello"));
        assert!(prompt.starts_with("<bos><start_of_turn>user"));
        assert!(prompt.ends_with("<start_of_turn>model\n"));
    }

    #[test]
    fn test_unambiguous_target_has_no_hint() {
        let request = TranslationRequest::text("en", "fr", "Hello");
        let message = translation_message(&request).unwrap();
        assert_eq!(message.content[0].text, "Hello");
        assert_eq!(message.content[0].target_lang_code, "fr");
    }

    #[test]
    fn test_non_text_type_is_rejected() {
        let mut request = TranslationRequest::text("en", "fr", "Hello");
        request.content_type = "image".into();
        let err = PromptBuilder::default().build(&request).unwrap_err();
        assert!(matches!(err, Error::UnsupportedContentType(t) if t == "image"));
    }

    #[test]
    fn test_model_template_receives_structured_codes() {
        let template = "{{ bos_token }}{% for m in messages %}{% for p in m.content %}\
            [{{ p.source_lang_code }}->{{ p.target_lang_code }}] {{ p.text }}{% endfor %}{% endfor %}";
        let builder = PromptBuilder::new(Some(template.into()), Some("<s>".into()), None);
        let prompt = builder.build(&TranslationRequest::text("en", "zh-TW", "Hi")).unwrap();
        assert_eq!(
            prompt,
            "<s>[en->zh-TW] Translate the following text into Traditional Chinese (繁體中文):\nHi"
        );
    }

    #[test]
    fn test_broken_model_template_falls_back() {
        let builder = PromptBuilder::new(Some("{{ raise_exception('nope') }}".into()), None, None);
        let prompt = builder.build(&TranslationRequest::text("ja", "en", "こんにちは")).unwrap();
        assert!(prompt.contains("Japanese (ja) to English (en)"));
        assert!(prompt.contains("こんにちは"));
    }

    #[test]
    fn test_language_lookup() {
        assert_eq!(language_name("zh-tw"), Some("Chinese (Traditional)"));
        assert_eq!(language_name("xx"), None);
        assert!(disambiguation_hint("zh").is_none());
    }
}
