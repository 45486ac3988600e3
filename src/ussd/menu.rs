use rusqlite::{Connection, OptionalExtension};

/// Fetch a menu string for `(country, language, key)` and substitute
/// `{name}` placeholders. A missing key degrades to a marker string rather
/// than failing the turn.
pub fn render(
    conn: &Connection,
    country: &str,
    language: &str,
    key: &str,
    vars: &[(&str, String)],
) -> String {
    let text: Option<String> = conn
        .query_row(
            "SELECT text FROM menu_texts WHERE country = ?1 AND language = ?2 AND menu_key = ?3",
            rusqlite::params![country, language, key],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten();

    match text {
        Some(template) => substitute(&template, vars),
        None => format!("Menu text not found: {key}"),
    }
}

fn substitute(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}
