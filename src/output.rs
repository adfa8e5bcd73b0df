use console::style;

pub fn success(msg: &str) -> String {
    format!("{} {}", style("✓").green().bold(), msg)
}

pub fn failure(msg: &str) -> String {
    format!("{} {}", style("✗").red().bold(), msg)
}

pub fn hint(msg: &str) -> String {
    style(msg).dim().to_string()
}
