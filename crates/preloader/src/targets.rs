use std::path::Path;
use url::Url;

/// Read one target per line, skipping blanks and `#` comments.
pub fn parse_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn load_file(path: &Path) -> std::io::Result<Vec<String>> {
    Ok(parse_list(&std::fs::read_to_string(path)?))
}

/// Merge command-line and file targets, dropping duplicates but keeping order.
pub fn merge(cli: Vec<String>, file: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    cli.into_iter()
        .chain(file)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// `<proxy>/api/proxy?url=<target>` with the target query-encoded.
pub fn preload_url(proxy_url: &str, target: &str) -> Result<Url, url::ParseError> {
    let base = Url::parse(proxy_url)?.join("/api/proxy")?;
    Url::parse_with_params(base.as_str(), &[("url", target)])
}
