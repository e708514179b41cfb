//! Prompts sent with every cell crop.
//!
//! Callers can override the system prompt via
//! [`crate::config::RecognitionConfig::system_prompt`]; the user instruction
//! is fixed because the reply parser in [`crate::pipeline::response`]
//! depends on the `{"latex": …}` shape it asks for.

/// Default system prompt for recognising the formula in one table cell.
pub const TABLE_CELL_SYSTEM_PROMPT: &str = r#"You are a meticulous OCR and formula-recognition assistant.

You receive an image of a single cell cropped from a table in a PDF document.

1. Transcribe every mathematical formula, symbol, unit or chemical expression
   visible in the cell as LaTeX.
2. Keep plain words as they are, wrapped in \text{...} when they sit inside a formula.
3. Do NOT add $ or $$ delimiters.
4. If the cell contains no formula, return an empty string.
5. Output ONLY a JSON object of the form {"latex": "..."} with no commentary
   and no code fences."#;

/// User-turn instruction accompanying the cell image.
pub const TABLE_CELL_INSTRUCTION: &str =
    "Recognise the formula in this table cell and output JSON {\"latex\": \"...\"}.";
