use std::collections::HashSet;
use std::fmt;

/// Capability the redlink filter needs from a wikitext parser.
///
/// Any implementation must be lossless: `serialize(parse(text)) == text` for
/// every input, so that a page with nothing removed is submitted unchanged.
pub trait WikitextParser {
    fn parse(&self, text: &str) -> Wikicode;
    fn wikilinks<'a>(&self, fragment: &'a Wikicode) -> Vec<&'a Wikilink>;
    fn serialize(&self, tree: &Wikicode) -> String;
}

/// Hand-rolled parser that understands exactly what hatnote cleanup needs:
/// template transclusions, wikilinks, template arguments, comments and
/// `<nowiki>` spans. Everything else is kept as opaque text.
#[derive(Debug, Clone, Copy, Default)]
pub struct BraceParser;

impl WikitextParser for BraceParser {
    fn parse(&self, text: &str) -> Wikicode {
        let (nodes, _, _) = Scanner::new(text).sequence(0, 0);
        Wikicode { nodes }
    }

    fn wikilinks<'a>(&self, fragment: &'a Wikicode) -> Vec<&'a Wikilink> {
        let mut out = Vec::new();
        fragment.collect_wikilinks(&mut out);
        out
    }

    fn serialize(&self, tree: &Wikicode) -> String {
        tree.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Wikicode {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Comment(String),
    Argument(String),
    Wikilink(Wikilink),
    Template(Template),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wikilink {
    /// Everything between `[[` and `]]`, verbatim.
    pub inner: String,
}

impl Wikilink {
    /// Link target: the text before the first `|`, trimmed.
    pub fn target(&self) -> &str {
        self.inner.split('|').next().unwrap_or("").trim()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    /// Name exactly as written, including surrounding whitespace.
    pub name: String,
    pub params: Vec<Parameter>,
}

impl Template {
    pub fn trimmed_name(&self) -> &str {
        self.name.trim()
    }
}

/// One `|`-separated template parameter. Named parameters keep their
/// `name=` prefix inside `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub value: Wikicode,
}

impl Wikicode {
    /// Calls `visit` for every template in the tree, outermost first,
    /// including templates nested inside parameters.
    pub fn visit_templates<F>(&self, visit: &mut F)
    where
        F: FnMut(&Template),
    {
        for node in &self.nodes {
            if let Node::Template(template) = node {
                visit(template);
                for param in &template.params {
                    param.value.visit_templates(visit);
                }
            }
        }
    }

    /// Removes every template for which `predicate` returns true and returns
    /// the removed templates in document order. Templates inside a removed
    /// template are not visited.
    ///
    /// At the top level, a removed template that started a line takes the
    /// following line break with it.
    pub fn remove_templates<F>(&mut self, predicate: &mut F) -> Vec<Template>
    where
        F: FnMut(&Template) -> bool,
    {
        let mut removed = Vec::new();
        self.remove_templates_inner(predicate, true, &mut removed);
        removed
    }

    fn remove_templates_inner<F>(
        &mut self,
        predicate: &mut F,
        collapse_lines: bool,
        removed: &mut Vec<Template>,
    ) where
        F: FnMut(&Template) -> bool,
    {
        let mut index = 0usize;
        while index < self.nodes.len() {
            let remove = match &mut self.nodes[index] {
                Node::Template(template) => {
                    if predicate(&*template) {
                        true
                    } else {
                        for param in &mut template.params {
                            param.value.remove_templates_inner(predicate, false, removed);
                        }
                        false
                    }
                }
                _ => false,
            };
            if !remove {
                index += 1;
                continue;
            }

            if let Node::Template(template) = self.nodes.remove(index) {
                removed.push(template);
            }
            if collapse_lines && self.starts_line(index) {
                self.strip_leading_newline(index);
            }
        }
    }

    fn starts_line(&self, index: usize) -> bool {
        if index == 0 {
            return true;
        }
        matches!(&self.nodes[index - 1], Node::Text(text) if text.ends_with('\n'))
    }

    fn strip_leading_newline(&mut self, index: usize) {
        let Some(Node::Text(text)) = self.nodes.get_mut(index) else {
            return;
        };
        if let Some(rest) = text.strip_prefix("\r\n").or_else(|| text.strip_prefix('\n')) {
            *text = rest.to_string();
        }
        if text.is_empty() {
            self.nodes.remove(index);
        }
    }

    fn collect_wikilinks<'a>(&'a self, out: &mut Vec<&'a Wikilink>) {
        for node in &self.nodes {
            match node {
                Node::Wikilink(link) => out.push(link),
                Node::Template(template) => {
                    for param in &template.params {
                        param.value.collect_wikilinks(out);
                    }
                }
                Node::Text(_) | Node::Comment(_) | Node::Argument(_) => {}
            }
        }
    }
}

impl fmt::Display for Wikicode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            write!(f, "{node}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(raw) | Self::Comment(raw) | Self::Argument(raw) => f.write_str(raw),
            Self::Wikilink(link) => write!(f, "[[{}]]", link.inner),
            Self::Template(template) => write!(f, "{template}"),
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{{{}", self.name)?;
        for param in &self.params {
            write!(f, "|{}", param.value)?;
        }
        f.write_str("}}")
    }
}

/// Templates nested deeper than this are kept as plain text.
pub const MAX_TEMPLATE_DEPTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Pipe,
    Close,
    End,
}

struct Scanner<'a> {
    src: &'a str,
    /// Offsets of `{{` already known not to form a template; each offset is
    /// tried once.
    rejected: HashSet<usize>,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            rejected: HashSet::new(),
        }
    }

    /// Scans nodes from `start`. Inside a template (`depth > 0`) the scan
    /// stops at the first `|` or `}}` of its own level.
    fn sequence(&mut self, start: usize, depth: usize) -> (Vec<Node>, usize, Stop) {
        let src = self.src;
        let in_template = depth > 0;
        let mut nodes = Vec::new();
        let mut text_start = start;
        let mut cursor = start;

        while cursor < src.len() {
            let rest = &src[cursor..];

            if in_template {
                if rest.starts_with("}}") {
                    push_text(&mut nodes, &src[text_start..cursor]);
                    return (nodes, cursor, Stop::Close);
                }
                if rest.starts_with('|') {
                    push_text(&mut nodes, &src[text_start..cursor]);
                    return (nodes, cursor, Stop::Pipe);
                }
            }

            if rest.starts_with("<!--") {
                // An unterminated comment swallows the rest of the page.
                let end = rest
                    .find("-->")
                    .map(|offset| cursor + offset + 3)
                    .unwrap_or(src.len());
                push_text(&mut nodes, &src[text_start..cursor]);
                nodes.push(Node::Comment(src[cursor..end].to_string()));
                cursor = end;
                text_start = cursor;
                continue;
            }

            if rest.starts_with("<nowiki>")
                && let Some(offset) = rest.find("</nowiki>")
            {
                cursor += offset + "</nowiki>".len();
                continue;
            }

            if rest.starts_with("{{{") {
                if let Some(offset) = rest[3..].find("}}}") {
                    let end = cursor + 3 + offset + 3;
                    push_text(&mut nodes, &src[text_start..cursor]);
                    nodes.push(Node::Argument(src[cursor..end].to_string()));
                    cursor = end;
                    text_start = cursor;
                } else {
                    cursor += 1;
                }
                continue;
            }

            if rest.starts_with("{{") {
                match self.template(cursor, depth + 1) {
                    Some((template, end)) => {
                        push_text(&mut nodes, &src[text_start..cursor]);
                        nodes.push(Node::Template(template));
                        cursor = end;
                        text_start = cursor;
                    }
                    None => cursor += 2,
                }
                continue;
            }

            if rest.starts_with("[[") {
                match find_link_end(src, cursor) {
                    Some(end) => {
                        push_text(&mut nodes, &src[text_start..cursor]);
                        nodes.push(Node::Wikilink(Wikilink {
                            inner: src[cursor + 2..end - 2].to_string(),
                        }));
                        cursor = end;
                        text_start = cursor;
                    }
                    None => cursor += 2,
                }
                continue;
            }

            cursor += rest.chars().next().map_or(1, char::len_utf8);
        }

        push_text(&mut nodes, &src[text_start..]);
        (nodes, src.len(), Stop::End)
    }

    /// Parses `{{name|param|...}}` starting at `start`. Returns the template
    /// and the byte offset just past its closing braces, or `None` when the
    /// braces never close, the name is blank (MediaWiki renders both
    /// literally) or the template would sit deeper than [`MAX_TEMPLATE_DEPTH`].
    fn template(&mut self, start: usize, depth: usize) -> Option<(Template, usize)> {
        if depth > MAX_TEMPLATE_DEPTH || self.rejected.contains(&start) {
            return None;
        }

        let src = self.src;
        let name_start = start + 2;
        let (_, name_end, mut stop) = self.sequence(name_start, depth);
        let name = &src[name_start..name_end];
        if stop == Stop::End || name.trim().is_empty() {
            self.rejected.insert(start);
            return None;
        }

        let mut params = Vec::new();
        let mut cursor = name_end;
        while stop == Stop::Pipe {
            let (nodes, end, next) = self.sequence(cursor + 1, depth);
            if next == Stop::End {
                self.rejected.insert(start);
                return None;
            }
            params.push(Parameter {
                value: Wikicode { nodes },
            });
            cursor = end;
            stop = next;
        }

        Some((
            Template {
                name: name.to_string(),
                params,
            },
            cursor + 2,
        ))
    }
}

/// Finds the end of a `[[...]]` link starting at `start`, allowing nested
/// links (image captions). Links never span lines.
fn find_link_end(src: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut cursor = start;
    while cursor < src.len() {
        let rest = &src[cursor..];
        if rest.starts_with("[[") {
            depth += 1;
            cursor += 2;
        } else if rest.starts_with("]]") {
            depth -= 1;
            cursor += 2;
            if depth == 0 {
                return Some(cursor);
            }
        } else if rest.starts_with('\n') {
            return None;
        } else {
            cursor += rest.chars().next().map_or(1, char::len_utf8);
        }
    }
    None
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if !text.is_empty() {
        nodes.push(Node::Text(text.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::{BraceParser, MAX_TEMPLATE_DEPTH, Node, WikitextParser};

    fn round_trip(text: &str) -> String {
        let parser = BraceParser;
        parser.serialize(&parser.parse(text))
    }

    #[test]
    fn serialization_is_lossless() {
        let samples = [
            "",
            "plain text only",
            "{{Hatnote|See also [[Real Page]]}}",
            "{{ About | the city |the river| River (disambiguation) }}\n'''City''' is...",
            "{{Infobox\n| name = {{lang|fr|Nom}}\n| image = [[File:X.jpg|thumb|A [[linked]] caption]]\n}}",
            "unclosed {{Hatnote|[[Foo]] text",
            "stray }} and | pipes and ]] brackets",
            "<!-- {{Hatnote|[[Hidden]]}} --> {{{1|default}}}",
            "<!-- never closed {{Hatnote}}",
            "<nowiki>{{Hatnote|[[Foo]]}}</nowiki>",
            "{{}} and {{ |x}} are not templates",
            "{{{{nested}}}} {{a|{{b|{{c}}}}}}",
            "Ünïcödé {{Hatnote|Sée [[Pagé_ñ]]}} ✓",
            "[[Broken link\n]] on two lines",
        ];
        for sample in samples {
            assert_eq!(round_trip(sample), sample, "round trip of {sample:?}");
        }
    }

    #[test]
    fn parses_template_name_and_parameters() {
        let tree = BraceParser.parse("x {{ Hatnote |See also [[A|label]]|for=[[B]]}} y");
        let templates = tree
            .nodes
            .iter()
            .filter_map(|node| match node {
                Node::Template(template) => Some(template),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].name, " Hatnote ");
        assert_eq!(templates[0].trimmed_name(), "Hatnote");
        assert_eq!(templates[0].params.len(), 2);
        assert_eq!(templates[0].params[0].value.to_string(), "See also [[A|label]]");
        assert_eq!(templates[0].params[1].value.to_string(), "for=[[B]]");
    }

    #[test]
    fn wikilinks_are_found_inside_parameters_and_nested_templates() {
        let parser = BraceParser;
        let tree = parser.parse("{{Hatnote|[[Alpha|a]] and {{em|[[Beta]]}}}} [[Gamma]]");
        let Node::Template(template) = &tree.nodes[0] else {
            panic!("expected template");
        };
        let targets = parser
            .wikilinks(&template.params[0].value)
            .into_iter()
            .map(|link| link.target().to_string())
            .collect::<Vec<_>>();
        assert_eq!(targets, vec!["Alpha".to_string(), "Beta".to_string()]);

        let all = parser.wikilinks(&tree);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn comments_and_nowiki_hide_templates() {
        let tree = BraceParser.parse("<!-- {{Hatnote}} --><nowiki>{{Hatnote}}</nowiki>");
        let mut count = 0;
        tree.visit_templates(&mut |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn visit_templates_descends_into_parameters() {
        let tree = BraceParser.parse("{{Outer|{{Inner|{{Deep}}}}}}");
        let mut names = Vec::new();
        tree.visit_templates(&mut |template| names.push(template.trimmed_name().to_string()));
        assert_eq!(names, vec!["Outer", "Inner", "Deep"]);
    }

    #[test]
    fn remove_templates_collapses_whole_line_hatnotes() {
        let mut tree = BraceParser.parse("{{A}}\n{{B}}\nIntro {{A}} text\n{{Keep}}\n");
        let removed = tree.remove_templates(&mut |template| template.trimmed_name() != "Keep");
        assert_eq!(removed.len(), 3);
        assert_eq!(tree.to_string(), "Intro  text\n{{Keep}}\n");
    }

    #[test]
    fn remove_templates_reaches_nested_templates() {
        let mut tree = BraceParser.parse("{{Box|before {{Drop}} after}}");
        let removed = tree.remove_templates(&mut |template| template.trimmed_name() == "Drop");
        assert_eq!(removed.len(), 1);
        assert_eq!(tree.to_string(), "{{Box|before  after}}");
    }

    #[test]
    fn wikilink_target_stops_at_first_pipe() {
        let tree = BraceParser.parse("[[ Target page |shown|extra]]");
        let Node::Wikilink(link) = &tree.nodes[0] else {
            panic!("expected wikilink");
        };
        assert_eq!(link.target(), "Target page");
    }

    #[test]
    fn many_unclosed_braces_parse_in_one_pass() {
        let text = "{{x".repeat(1_000);
        let tree = BraceParser.parse(&text);
        assert_eq!(tree.to_string(), text);
        let mut count = 0;
        tree.visit_templates(&mut |_| count += 1);
        assert_eq!(count, 0);

        let mixed = format!("{}{{{{Hatnote|[[A]]}}}}", "{{open [[x]] | ".repeat(500));
        let tree = BraceParser.parse(&mixed);
        assert_eq!(tree.to_string(), mixed);
    }

    #[test]
    fn nesting_beyond_the_cap_stays_text() {
        let levels = 20_000;
        let text = format!("{}{}", "{{a|".repeat(levels), "}}".repeat(levels));
        let tree = BraceParser.parse(&text);
        assert_eq!(tree.to_string(), text);

        let mut count = 0;
        tree.visit_templates(&mut |_| count += 1);
        assert!(count <= MAX_TEMPLATE_DEPTH, "{count} templates parsed");
        assert!(count > 0);
    }

    #[test]
    fn nesting_up_to_the_cap_is_parsed() {
        let text = format!(
            "{}{}",
            "{{a|".repeat(MAX_TEMPLATE_DEPTH),
            "}}".repeat(MAX_TEMPLATE_DEPTH)
        );
        let tree = BraceParser.parse(&text);
        let mut count = 0;
        tree.visit_templates(&mut |_| count += 1);
        assert_eq!(count, MAX_TEMPLATE_DEPTH);
    }
}
