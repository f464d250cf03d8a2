use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};

use crate::mediawiki::WikiReadApi;
use crate::redlink::ExistenceOracle;

/// Most titles the Action API accepts in one `titles=` query for
/// non-privileged accounts.
pub const MAX_TITLES_PER_QUERY: usize = 50;

/// Run-scoped existence cache that batches lookups against the wiki.
#[derive(Debug, Default)]
pub struct ExistenceResolver {
    cache: BTreeMap<String, bool>,
    queries_issued: usize,
}

impl ExistenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves every title, querying only the ones not already cached.
    ///
    /// The returned map is keyed by normalized title (see [`normalize_title`]);
    /// titles that normalize to nothing are left out. `n` uncached titles cost
    /// `ceil(n / 50)` queries.
    pub fn resolve<A, I, S>(&mut self, api: &mut A, titles: I) -> Result<BTreeMap<String, bool>>
    where
        A: WikiReadApi + ?Sized,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let requested = titles
            .into_iter()
            .filter_map(|title| normalize_title(title.as_ref()))
            .collect::<BTreeSet<_>>();
        let pending = requested
            .iter()
            .filter(|title| !self.cache.contains_key(*title))
            .cloned()
            .collect::<Vec<_>>();

        for batch in pending.chunks(MAX_TITLES_PER_QUERY) {
            let answer = api
                .page_existence(batch)
                .with_context(|| format!("existence query for {} titles failed", batch.len()))?;
            self.queries_issued += 1;
            for title in batch {
                self.cache.insert(title.clone(), answer.exists(title));
            }
        }

        Ok(requested
            .into_iter()
            .filter_map(|title| {
                let exists = self.cache.get(&title).copied()?;
                Some((title, exists))
            })
            .collect())
    }

    pub fn cached(&self, title: &str) -> Option<bool> {
        let key = normalize_title(title)?;
        self.cache.get(&key).copied()
    }

    pub fn queries_issued(&self) -> usize {
        self.queries_issued
    }

    pub fn cached_titles(&self) -> usize {
        self.cache.len()
    }
}

/// Pairs a resolver with the API it queries for the duration of one filter
/// call.
pub struct LiveExistence<'a, A: ?Sized> {
    api: &'a mut A,
    resolver: &'a mut ExistenceResolver,
}

impl<'a, A: WikiReadApi + ?Sized> LiveExistence<'a, A> {
    pub fn new(api: &'a mut A, resolver: &'a mut ExistenceResolver) -> Self {
        Self { api, resolver }
    }
}

impl<A: WikiReadApi + ?Sized> ExistenceOracle for LiveExistence<'_, A> {
    fn resolve(&mut self, titles: &BTreeSet<String>) -> Result<BTreeMap<String, bool>> {
        self.resolver.resolve(&mut *self.api, titles)
    }
}

/// Canonical form used as the cache key: underscores become spaces, runs of
/// whitespace collapse, leading colons and any `#fragment` are dropped and
/// the first letter is upper-cased when its upper case is a single
/// character. Letters like `ß` whose upper case expands are left alone; the
/// wiki's own `normalized` answer covers whatever it does with them.
pub fn normalize_title(raw: &str) -> Option<String> {
    let replaced = raw.replace('_', " ");
    let mut value = replaced.trim();
    while let Some(stripped) = value.strip_prefix(':') {
        value = stripped.trim_start();
    }
    if let Some((without_fragment, _)) = value.split_once('#') {
        value = without_fragment;
    }

    let collapsed = normalize_spaces(value);
    let mut chars = collapsed.chars();
    let first = chars.next()?;
    let mut upper = first.to_uppercase();
    let first = match (upper.next(), upper.next()) {
        (Some(single), None) => single,
        _ => first,
    };
    Some(std::iter::once(first).chain(chars).collect())
}

fn normalize_spaces(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut previous_was_space = false;

    for ch in value.chars() {
        if ch.is_whitespace() {
            if !previous_was_space {
                output.push(' ');
                previous_was_space = true;
            }
        } else {
            output.push(ch);
            previous_was_space = false;
        }
    }

    output.trim().to_string()
}
