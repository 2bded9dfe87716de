//! Field-selective entry search.
//!
//! Results come back in pre-order tree position. Entries inside the
//! recycle bin or below a group with searching disabled never match;
//! the nearest explicit group override wins over inherited state.

use regex::RegexBuilder;
use uuid::Uuid;

use crate::db::{Database, Entry};
use crate::error::{Error, Result};

/// Which fields participate in a search, and how terms are interpreted.
#[derive(Debug, Clone)]
pub struct SearchParameters {
    pub case_sensitive: bool,
    /// Treat the whole query as one regular expression. Negated terms
    /// are not available in this mode.
    pub regex: bool,
    pub exclude_expired: bool,
    pub exclude_recycle_bin: bool,
    pub in_titles: bool,
    pub in_usernames: bool,
    pub in_passwords: bool,
    pub in_urls: bool,
    pub in_notes: bool,
    pub in_uuids: bool,
    pub in_tags: bool,
    pub in_other_fields: bool,
    pub in_group_names: bool,
}

impl Default for SearchParameters {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            regex: false,
            exclude_expired: false,
            exclude_recycle_bin: true,
            in_titles: true,
            in_usernames: true,
            in_passwords: false,
            in_urls: true,
            in_notes: true,
            in_uuids: false,
            in_tags: true,
            in_other_fields: true,
            in_group_names: false,
        }
    }
}

/// Find matching entries, in pre-order position.
///
/// The query splits on whitespace into terms that must all match; a
/// leading `-` negates a term. In regex mode the query is one pattern.
pub fn search(database: &Database, query: &str, params: &SearchParameters) -> Result<Vec<Uuid>> {
    let matcher = Matcher::compile(query, params)?;
    let mut results = Vec::new();
    for uuid in database.entries_preorder() {
        let Some(entry) = database.entry(&uuid) else {
            continue;
        };
        if !entry_searchable(database, entry, params) {
            continue;
        }
        if matcher.matches(database, entry, params) {
            results.push(uuid);
        }
    }
    Ok(results)
}

fn entry_searchable(database: &Database, entry: &Entry, params: &SearchParameters) -> bool {
    if params.exclude_expired && entry.is_expired() {
        return false;
    }
    let Some(parent) = entry.parent else {
        return false;
    };
    if params.exclude_recycle_bin && database.is_in_recycle_bin(&parent) {
        return false;
    }
    searching_allowed(database, parent)
}

/// Walk up the tree; the nearest explicit override decides.
fn searching_allowed(database: &Database, mut uuid: Uuid) -> bool {
    loop {
        let Some(group) = database.group(&uuid) else {
            return false;
        };
        if let Some(enabled) = group.enable_searching {
            return enabled;
        }
        match group.parent {
            Some(parent) => uuid = parent,
            None => return true,
        }
    }
}

enum Matcher {
    Regex(regex::Regex),
    Terms {
        positive: Vec<String>,
        negative: Vec<String>,
    },
}

impl Matcher {
    fn compile(query: &str, params: &SearchParameters) -> Result<Self> {
        if params.regex {
            let regex = RegexBuilder::new(query)
                .case_insensitive(!params.case_sensitive)
                .build()
                .map_err(|e| Error::malformed(format!("search pattern: {e}")))?;
            return Ok(Matcher::Regex(regex));
        }

        let mut positive = Vec::new();
        let mut negative = Vec::new();
        for term in query.split_whitespace() {
            if let Some(stripped) = term.strip_prefix('-') {
                if !stripped.is_empty() {
                    negative.push(fold_case(stripped, params));
                    continue;
                }
            }
            positive.push(fold_case(term, params));
        }
        // Longest terms first: the most selective filters run earliest.
        positive.sort_by_key(|t| std::cmp::Reverse(t.len()));
        negative.sort_by_key(|t| std::cmp::Reverse(t.len()));
        Ok(Matcher::Terms { positive, negative })
    }

    fn matches(&self, database: &Database, entry: &Entry, params: &SearchParameters) -> bool {
        let fields = searchable_fields(database, entry, params);
        match self {
            Matcher::Regex(regex) => fields.iter().any(|f| regex.is_match(f)),
            Matcher::Terms { positive, negative } => {
                let folded: Vec<String> =
                    fields.iter().map(|f| fold_case(f, params)).collect();
                positive
                    .iter()
                    .all(|term| folded.iter().any(|f| f.contains(term.as_str())))
                    && !negative
                        .iter()
                        .any(|term| folded.iter().any(|f| f.contains(term.as_str())))
            }
        }
    }
}

fn fold_case(text: &str, params: &SearchParameters) -> String {
    if params.case_sensitive {
        text.to_owned()
    } else {
        text.to_lowercase()
    }
}

fn searchable_fields(
    database: &Database,
    entry: &Entry,
    params: &SearchParameters,
) -> Vec<String> {
    let mut fields = Vec::new();
    if params.in_titles {
        fields.push(entry.title.clone());
    }
    if params.in_usernames {
        fields.push(entry.username.clone());
    }
    if params.in_passwords {
        fields.push(entry.password().to_owned());
    }
    if params.in_urls {
        fields.push(entry.url.clone());
    }
    if params.in_notes {
        fields.push(entry.notes.clone());
    }
    if params.in_uuids {
        fields.push(entry.uuid_hex());
    }
    if params.in_tags {
        fields.extend(entry.tags.iter().cloned());
    }
    if params.in_other_fields {
        fields.extend(entry.custom_fields.values().map(|f| f.value.clone()));
    }
    if params.in_group_names {
        if let Some(group) = entry.parent.and_then(|p| database.group(&p)) {
            fields.push(group.name.clone());
        }
    }
    fields
}
