//! `Link` response header parsing for paginated GitHub endpoints.

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PageLinks<'a> {
    pub first: Option<&'a str>,
    pub last: Option<&'a str>,
    pub next: Option<&'a str>,
    pub prev: Option<&'a str>,
}

/// Parse `<url>; rel="next", <url>; rel="last"` into its relations.
///
/// Entries without a bracketed URL or a `rel` parameter are ignored.
pub fn parse(link_header: &str) -> PageLinks<'_> {
    let mut links = PageLinks::default();

    for link in link_header.split(',') {
        let mut segments = link.split(';');
        let url = segments.next().map(str::trim).and_then(|url_segment| {
            url_segment
                .strip_prefix('<')
                .and_then(|rest| rest.strip_suffix('>'))
        });
        let rel = segments
            .map(str::trim)
            .find_map(|segment| segment.strip_prefix("rel="));
        if let (Some(url), Some(rel)) = (url, rel) {
            // rel may carry several space-separated relation types
            for relation in rel.trim_matches('"').split_whitespace() {
                match relation {
                    "first" => links.first = Some(url),
                    "last" => links.last = Some(url),
                    "next" => links.next = Some(url),
                    "prev" => links.prev = Some(url),
                    _ => {}
                }
            }
        }
    }

    links
}
