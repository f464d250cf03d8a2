use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::existence::normalize_title;
use crate::wikitext::{Template, WikitextParser};

/// Answers "does this page exist?" for a set of normalized titles.
pub trait ExistenceOracle {
    fn resolve(&mut self, titles: &BTreeSet<String>) -> Result<BTreeMap<String, bool>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub template: String,
    pub missing_target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    pub text: String,
    pub modified: bool,
    pub removals: Vec<Removal>,
}

/// Removes hatnote templates whose wikilinks point at pages that do not
/// exist.
///
/// A template matches when its trimmed name is exactly one of `names`. It is
/// removed as soon as one of its link targets is confirmed missing; a
/// template without judgeable wikilinks always stays.
#[derive(Debug, Clone)]
pub struct RedlinkFilter<P> {
    parser: P,
    names: BTreeSet<String>,
}

impl<P: WikitextParser> RedlinkFilter<P> {
    pub fn new(parser: P, names: BTreeSet<String>) -> Self {
        Self { parser, names }
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    pub fn apply<O>(&self, wikitext: &str, oracle: &mut O) -> Result<FilterOutcome>
    where
        O: ExistenceOracle + ?Sized,
    {
        let mut tree = self.parser.parse(wikitext);

        let mut wanted = BTreeSet::new();
        tree.visit_templates(&mut |template| {
            if self.matches(template) {
                wanted.extend(self.link_targets(template));
            }
        });
        if wanted.is_empty() {
            return Ok(unchanged(wikitext));
        }

        let existence = oracle.resolve(&wanted)?;
        let mut removals = Vec::new();
        tree.remove_templates(&mut |template| {
            if !self.matches(template) {
                return false;
            }
            let missing = self
                .link_targets(template)
                .into_iter()
                .find(|target| existence.get(target) == Some(&false));
            match missing {
                Some(target) => {
                    removals.push(Removal {
                        template: template.trimmed_name().to_string(),
                        missing_target: target,
                    });
                    true
                }
                None => false,
            }
        });

        if removals.is_empty() {
            return Ok(unchanged(wikitext));
        }
        Ok(FilterOutcome {
            text: self.parser.serialize(&tree),
            modified: true,
            removals,
        })
    }

    fn matches(&self, template: &Template) -> bool {
        self.names.contains(template.trimmed_name())
    }

    /// Normalized wikilink targets found in the template's parameters, in
    /// document order, without duplicates.
    fn link_targets(&self, template: &Template) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut targets = Vec::new();
        for param in &template.params {
            for link in self.parser.wikilinks(&param.value) {
                let Some(title) = judgeable_target(link.target()) else {
                    continue;
                };
                if seen.insert(title.clone()) {
                    targets.push(title);
                }
            }
        }
        targets
    }
}

/// Normalized title for a link target, or `None` when existence of the
/// target cannot be decided from the wikitext alone.
fn judgeable_target(target: &str) -> Option<String> {
    let target = target.trim();
    if target.starts_with('#') {
        return None;
    }
    if target.contains("{{") || target.contains("}}") {
        return None;
    }
    let lowered = target.to_ascii_lowercase();
    if lowered.starts_with("http://") || lowered.starts_with("https://") || target.starts_with("//")
    {
        return None;
    }
    normalize_title(target)
}

fn unchanged(wikitext: &str) -> FilterOutcome {
    FilterOutcome {
        text: wikitext.to_string(),
        modified: false,
        removals: Vec::new(),
    }
}
