use serde_json::Value;

/// Tool output fed back to the model is capped at this many bytes.
pub const MAX_TOOL_OUTPUT: usize = 256 * 1024;

/// Previews carried on tool-call events are capped at this many chars.
pub const PREVIEW_CHARS: usize = 200;

/// Truncate tool output if it exceeds `max_bytes`.
/// Truncates at a char boundary and appends a marker showing original vs truncated size.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut boundary = max_bytes;
    while !output.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!(
        "{}\n\n[truncated: {} bytes -> {} bytes]",
        &output[..boundary],
        output.len(),
        boundary
    )
}

/// First `max_chars` characters of `text`, with `...` appended when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Preview of tool arguments. The conventional free-text `input` argument is
/// shown bare; anything else as compact JSON.
pub fn args_preview(args: &Value, max_chars: usize) -> String {
    match args.get("input").and_then(Value::as_str) {
        Some(input) if args.as_object().is_some_and(|o| o.len() == 1) => preview(input, max_chars),
        _ => preview(&args.to_string(), max_chars),
    }
}
