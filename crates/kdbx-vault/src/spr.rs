//! `{REF:…}` field reference resolution.
//!
//! A placeholder has the shape `{REF:<Wanted>@<Scan>:<Term>}`: scan the
//! database for the first entry (pre-order) whose scan field contains
//! the term, then substitute the wanted field of that entry. Resolved
//! values are themselves resolved, relative to the referenced entry, up
//! to a fixed depth. Anything unresolvable stays in the text verbatim.

use std::collections::HashMap;

use uuid::Uuid;

use crate::db::{Database, Entry};

const REF_PREFIX: &str = "{REF:";
const MAX_RECURSION_DEPTH: u32 = 12;

/// Resolve all references in `text` taken from the given entry. Unknown
/// placeholders and missing targets are left as-is.
pub fn resolve(database: &Database, entry_uuid: &Uuid, text: &str) -> String {
    if database.entry(entry_uuid).is_none() {
        return text.to_owned();
    }
    let mut cache = HashMap::new();
    resolve_at(database, text, 0, &mut cache)
}

fn resolve_at(
    database: &Database,
    text: &str,
    depth: u32,
    cache: &mut HashMap<(String, u32), String>,
) -> String {
    if depth >= MAX_RECURSION_DEPTH || !text.contains('{') {
        return text.to_owned();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = find_ignore_case(rest, REF_PREFIX) {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(close) = tail.find('}') else {
            // No closing brace: the rest is literal text.
            out.push_str(tail);
            return out;
        };
        let placeholder = &tail[..=close];
        match lookup(database, placeholder, depth, cache) {
            Some(value) => out.push_str(&value),
            None => out.push_str(placeholder),
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    out
}

fn lookup(
    database: &Database,
    placeholder: &str,
    depth: u32,
    cache: &mut HashMap<(String, u32), String>,
) -> Option<String> {
    // A value resolved near the recursion cap may still contain verbatim
    // references, so cached values are only valid at the same depth.
    let cache_key = (placeholder.to_uppercase(), depth);
    if let Some(cached) = cache.get(&cache_key) {
        return Some(cached.clone());
    }

    // {REF:W@S:term}
    let inner = &placeholder[REF_PREFIX.len()..placeholder.len() - 1];
    let mut chars = inner.chars();
    let wanted = chars.next()?.to_ascii_uppercase();
    if chars.next()? != '@' {
        return None;
    }
    let scan = chars.next()?.to_ascii_uppercase();
    if chars.next()? != ':' {
        return None;
    }
    let term = chars.as_str();
    if term.is_empty() {
        return None;
    }

    let target = find_target(database, scan, term)?;
    let raw = wanted_field(target, wanted)?;
    // The referenced value may itself hold further references.
    let resolved = resolve_at(database, &raw, depth + 1, cache);
    cache.insert(cache_key, resolved.clone());
    Some(resolved)
}

fn find_target<'a>(database: &'a Database, scan: char, term: &str) -> Option<&'a Entry> {
    let needle = term.to_lowercase();
    for uuid in database.entries_preorder() {
        let entry = database.entry(&uuid)?;
        let matched = match scan {
            'T' => contains_ci(&entry.title, &needle),
            'U' => contains_ci(&entry.username, &needle),
            'A' => contains_ci(&entry.url, &needle),
            'P' => contains_ci(entry.password(), &needle),
            'N' => contains_ci(&entry.notes, &needle),
            'I' => entry.uuid_hex().eq_ignore_ascii_case(term),
            'O' => entry
                .custom_fields
                .values()
                .any(|f| contains_ci(&f.value, &needle)),
            _ => return None,
        };
        if matched {
            return Some(entry);
        }
    }
    None
}

fn wanted_field(entry: &Entry, wanted: char) -> Option<String> {
    match wanted {
        'T' => Some(entry.title.clone()),
        'U' => Some(entry.username.clone()),
        'A' => Some(entry.url.clone()),
        'P' => Some(entry.password().to_owned()),
        'N' => Some(entry.notes.clone()),
        'I' => Some(entry.uuid_hex()),
        _ => None,
    }
}

fn contains_ci(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_lowercase().contains(needle_lower)
}

// Byte-wise scan: the needle is ASCII, so case folding never shifts
// offsets the way `str::to_uppercase` can.
fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}
