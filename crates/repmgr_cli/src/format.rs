use crate::args::GlobalArgs;

/// Output mode selected by the global flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Text,
    Csv,
    Nagios,
    Optformat,
}

impl OutputMode {
    /// `--nagios` wins over `--optformat`, which wins over `--csv`.
    pub fn from_args(global: &GlobalArgs) -> Self {
        if global.nagios {
            Self::Nagios
        } else if global.optformat {
            Self::Optformat
        } else if global.csv {
            Self::Csv
        } else {
            Self::Text
        }
    }
}

/// Render an aligned text table: a header row, a separator, then one line
/// per row. Columns are as wide as their widest cell.
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    let mut out = render_row(headers.iter().copied(), &widths);
    let sep: Vec<String> = widths.iter().map(|w| "-".repeat(w + 2)).collect();
    out.push_str(&sep.join("+"));
    out.push('\n');
    for row in rows {
        out.push_str(&render_row(row.iter().map(String::as_str), &widths));
    }
    out
}

fn render_row<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let parts: Vec<String> = cells
        .zip(widths.iter())
        .map(|(c, w)| format!("{:<width$}", c, width = *w))
        .collect();
    let mut line = format!(" {}", parts.join(" | ")).trim_end().to_string();
    line.push('\n');
    line
}
