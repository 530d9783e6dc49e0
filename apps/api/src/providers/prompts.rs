// Prompts for the text enhancement provider.

use super::GenerationRequest;

/// System prompt fragment that enforces JSON-only output.
pub const JSON_ONLY_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

pub const ENHANCEMENT_SYSTEM: &str = "You are an expert CV editor. You rewrite and extend \
    sections of an HTML CV without inventing facts. Every claim must already be present \
    in the supplied document. Output clean semantic HTML fragments: no <html>, <head>, \
    <body>, <script> or <style> elements, no inline event handlers.";

/// Longest document excerpt sent to the model.
const MAX_DOCUMENT_CHARS: usize = 24_000;

pub fn enhancement_system() -> String {
    format!("{ENHANCEMENT_SYSTEM}\n\n{JSON_ONLY_SYSTEM}")
}

pub fn enhancement_prompt(request: &GenerationRequest) -> String {
    let document: String = request.document_html.chars().take(MAX_DOCUMENT_CHARS).collect();
    let target = request
        .placement
        .target_selector
        .as_deref()
        .unwrap_or("(none, content is appended)");

    format!(
        r#"Improve the CV below according to the instructions.

## Instructions
{instructions}

## Default placement
strategy: {strategy:?}
target selector: {target}

## Current CV (HTML)
{document}

Return JSON in exactly this shape:
{{
  "sections": [
    {{
      "name": "short human-readable section name",
      "html": "<section>...</section>",
      "strategy": "replace-section | insert-after | insert-before | append (optional)",
      "target_selector": "simple CSS selector such as section#skills (optional)"
    }}
  ],
  "quality": 0.0
}}

"quality" is your own 0.0 to 1.0 estimate of how well the sections satisfy the instructions."#,
        instructions = request.instructions.trim(),
        strategy = request.placement.strategy,
    )
}
