/// Quote a CSV field when it contains a comma, a quote or a line break.
/// Embedded quotes are doubled.
pub fn quote_field(value: &str) -> String {
    let needs_quoting = value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r');
    if needs_quoting {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// One CSV line, newline-terminated.
pub fn csv_line(fields: &[String]) -> String {
    let mut line = fields.iter().map(|f| quote_field(f)).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}
