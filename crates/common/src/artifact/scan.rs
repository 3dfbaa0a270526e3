// Low-level tag scanning over partially streamed markup.

/// Result of looking for an opening tag at or after some offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagHit {
    /// `<name` followed by whitespace, `>` or `/`.
    Open { start: usize, name_index: usize },
    /// A closing tag from the `closers` list starting at `start`.
    Close { start: usize, end: usize },
    /// Text ends in something that may still grow into one of the tags.
    Partial { start: usize },
}

/// Walk `<` positions from `from`, returning the first that opens one of
/// `names`, closes with one of `closers`, or is cut off by end of input
/// while still compatible with either.
pub(crate) fn next_tag(text: &str, from: usize, names: &[&str], closers: &[&str]) -> Option<TagHit> {
    let bytes = text.as_bytes();
    let mut cursor = from;
    while let Some(offset) = text[cursor..].find('<') {
        let lt = cursor + offset;
        let rest = &text[lt..];

        for closer in closers {
            if rest.starts_with(closer) {
                return Some(TagHit::Close { start: lt, end: lt + closer.len() });
            }
            if closer.starts_with(rest) {
                return Some(TagHit::Partial { start: lt });
            }
        }

        let after_lt = &text[lt + 1..];
        for (name_index, name) in names.iter().enumerate() {
            if after_lt.starts_with(name) {
                match bytes.get(lt + 1 + name.len()) {
                    None => return Some(TagHit::Partial { start: lt }),
                    Some(b) if b.is_ascii_whitespace() || *b == b'>' || *b == b'/' => {
                        return Some(TagHit::Open { start: lt, name_index });
                    }
                    Some(_) => {}
                }
            } else if name.starts_with(after_lt) {
                return Some(TagHit::Partial { start: lt });
            }
        }

        cursor = lt + 1;
    }
    None
}

/// Offset of the `>` that ends the tag opened at `start`, honoring quoted
/// attribute values. `None` when the tag is still streaming.
pub(crate) fn tag_end(text: &str, start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (index, byte) in text.as_bytes().iter().enumerate().skip(start + 1) {
        match (quote, *byte) {
            (Some(q), b) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"') | (None, b'\'') => quote = Some(*byte),
            (None, b'>') => return Some(index),
            (None, _) => {}
        }
    }
    None
}

/// Parse `key="value" key2='value'` pairs. Unquoted values run to the next
/// whitespace; bare keys get an empty value.
pub(crate) fn parse_attributes(source: &str) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    let mut chars = source.char_indices().peekable();

    loop {
        while chars.next_if(|(_, c)| c.is_whitespace() || *c == '/').is_some() {}
        let Some(&(key_start, _)) = chars.peek() else {
            break;
        };
        let mut key_end = source.len();
        while let Some(&(index, c)) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                key_end = index;
                break;
            }
            chars.next();
        }
        let key = source[key_start..key_end].to_string();

        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        if chars.next_if(|(_, c)| *c == '=').is_none() {
            attributes.push((key, String::new()));
            continue;
        }
        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let value = match chars.peek().copied() {
            Some((index, quote @ ('"' | '\''))) => {
                chars.next();
                let value_start = index + 1;
                let mut value_end = source.len();
                for (i, c) in chars.by_ref() {
                    if c == quote {
                        value_end = i;
                        break;
                    }
                }
                &source[value_start..value_end]
            }
            Some((index, _)) => {
                let mut value_end = source.len();
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_whitespace() {
                        value_end = i;
                        break;
                    }
                    chars.next();
                }
                &source[index..value_end]
            }
            None => "",
        };
        attributes.push((key, decode_entities(value)));
    }

    attributes
}

fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

pub(crate) fn attribute<'a>(attributes: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}
