//! Prompt augmentation: wraps the user's question and the retrieved context in a fixed
//! instruction template that constrains the engine to a small JSON answer.

use crate::clients::vector::QueryHit;

/// Per-entry cap for the `text` array, stated in the template.
pub const MAX_TEXT_CHARS: usize = 50;

/// Returned by the engine when it cannot answer from what it was given.
pub const FALLBACK_ANSWER: &str = r#"{"accuracy":"0%","text":["unknown"]}"#;

/// One retrieved document per line, in ranking order.
pub fn join_context(hits: &[QueryHit]) -> String {
    hits.iter().map(|hit| format!("{}\n", hit.document)).collect()
}

/// Deterministic: the same prompt and context always yield the same text.
pub fn augment_prompt(prompt: &str, context: &str) -> String {
    format!(
        "\r\nCondition: \r\n\
         1. Answer only from the context below. No opinions or subjectivity are necessary.\r\n\
         2. It must be in JSON format. Any format other than JSON is not allowed.\r\n\
         3. The parameters of the JSON statement are as follows: accuracy, text (array of strings).\r\n\
         4. \"accuracy\" is the accuracy of your answer as a percentage, \"text\" holds the actual answer.\r\n\
         5. Output the JSON statement in the following format: {{ \"accuracy\": \"50%\", \"text\": [ \"This is a sample text_1.\", \"This is a sample text_2.\" ] }}\r\n\
         6. If the information is insufficient, output {fallback}\r\n\
         7. You can only put a maximum of {max} characters in each text entry.\r\n\
         8. Do not output ```json & ```\r\n\r\n\
         Context:\r\n{context}\r\n\
         Question: {prompt}",
        fallback = FALLBACK_ANSWER,
        max = MAX_TEXT_CHARS,
        context = context,
        prompt = prompt,
    )
}
