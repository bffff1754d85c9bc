// src/gcode/mod.rs - protocol framing tokens and comment stripping
//
// Only the tokens the host needs for framing are known here; every other line
// is opaque text passed through to the printer.

pub const BEGIN_FILE_LIST: &str = "Begin file list";
pub const END_FILE_LIST: &str = "End file list";
pub const DONE_PRINTING: &str = "Done printing file";

pub const LIST_SD_FILES: &str = "M20";
pub const START_SD_PRINT: &str = "M24";

pub fn select_sd_file(file_name: &str) -> String {
    format!("M23 {}", file_name)
}

pub fn begin_sd_write(file_name: &str) -> String {
    format!("M28 {}", file_name)
}

pub fn end_sd_write(file_name: &str) -> String {
    format!("M29 {}", file_name)
}

/// Remove `;` comments and `( ... )` comments, then trim.
///
/// Returns `None` when nothing but whitespace remains. An unterminated `(`
/// comments out the rest of the line.
pub fn strip_comments(line: &str) -> Option<String> {
    let mut out = String::with_capacity(line.len());
    let mut in_paren = false;
    for c in line.chars() {
        match c {
            ';' if !in_paren => break,
            '(' if !in_paren => in_paren = true,
            ')' if in_paren => in_paren = false,
            '\r' | '\n' => break,
            _ if in_paren => {}
            _ => out.push(c),
        }
    }
    let trimmed = out.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
