//! Welcome text written to a client's status channel.

/// Banner listing the public URLs of tunnel `id` forwarded on `port`.
pub fn render_banner(domain: &str, id: &str, port: u16) -> String {
    let rows = [
        ("HTTP", format!("http://{id}.{domain}")),
        ("HTTPS", format!("https://{id}.{domain}")),
        ("TCP", format!("tcp://{domain}:{port}")),
    ];

    let proto_width = rows
        .iter()
        .map(|(p, _)| p.len())
        .chain(["Protocol".len()])
        .max()
        .unwrap_or(0);
    let url_width = rows
        .iter()
        .map(|(_, u)| u.chars().count())
        .chain(["URL".len()])
        .max()
        .unwrap_or(0);

    let rule = |left: char, mid: char, right: char| {
        format!(
            "{left}{}{mid}{}{right}\n",
            "━".repeat(proto_width + 2),
            "━".repeat(url_width + 2)
        )
    };

    let mut out = format!(
        "Welcome to bore server {} at {domain}\n\n",
        env!("CARGO_PKG_VERSION")
    );
    out.push_str(&rule('┏', '┳', '┓'));
    out.push_str(&format!(
        "┃ {:<proto_width$} ┃ {:<url_width$} ┃\n",
        "Protocol", "URL"
    ));
    out.push_str(&rule('┣', '╋', '┫'));
    for (proto, url) in &rows {
        out.push_str(&format!("┃ {proto:<proto_width$} ┃ {url:<url_width$} ┃\n"));
    }
    out.push_str(&rule('┗', '┻', '┛'));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_lists_all_urls() {
        let banner = render_banner("example.com", "abc123", 55001);
        assert!(banner.starts_with("Welcome to bore server"));
        assert!(banner.contains("at example.com"));
        assert!(banner.contains("http://abc123.example.com"));
        assert!(banner.contains("https://abc123.example.com"));
        assert!(banner.contains("tcp://example.com:55001"));
    }

    #[test]
    fn table_rows_line_up() {
        let banner = render_banner("example.com", "abc123", 55001);
        let widths: Vec<usize> = banner
            .lines()
            .filter(|l| l.starts_with(['┏', '┃', '┣', '┗']))
            .map(|l| l.chars().count())
            .collect();
        assert_eq!(widths.len(), 7);
        assert!(widths.iter().all(|w| *w == widths[0]));
    }
}
